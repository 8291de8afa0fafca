extern crate postgres;
extern crate postgres_openssl;

use crate::config::{PostgresConfig, SchemaStrategy, TableLayout};
use crate::decode::Value;
use crate::error::{PollError, Result};
use crate::pivot::{PivotRow, PivotTable, SECTION_COLUMN};
use crate::session::{DecodedReading, PollPass};
use chrono::NaiveDateTime;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres::types::ToSql;
use postgres::GenericClient;
use postgres_openssl::MakeTlsConnector;
use std::collections::BTreeSet;

pub const ID_COLUMN: &str = "id";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Float,
    Integer,
    Text,
}

impl ColumnKind {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Float => "DOUBLE PRECISION",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Text => "TEXT",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    fn new(name: &str, kind: ColumnKind) -> Self {
        Column {
            name: name.to_string(),
            kind,
        }
    }
}

/// Turns free-text register names into stable column identifiers.
pub fn sanitize_column(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_junk = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            in_junk = false;
        } else if !in_junk {
            out.push('_');
            in_junk = true;
        }
    }
    let mut out = out.trim_matches('_').to_string();
    if out.is_empty() {
        return "unnamed".into();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "c_");
    }
    // ascii only from here on, so byte truncation is safe
    out.truncate(MAX_IDENTIFIER_LEN);
    out
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaPlan {
    Create,
    Recreate,
    AddColumns(Vec<Column>),
    UpToDate,
}

/// Decides what has to happen to a table whose current column names are
/// `existing` (`None` when the table is missing).
pub fn plan_schema(
    existing: Option<&[String]>,
    expected: &[Column],
    strategy: SchemaStrategy,
) -> SchemaPlan {
    let existing: BTreeSet<&str> = match existing {
        None => return SchemaPlan::Create,
        Some(cols) => cols.iter().map(|c| c.as_str()).collect(),
    };
    let missing: Vec<Column> = expected
        .iter()
        .filter(|c| !existing.contains(c.name.as_str()))
        .cloned()
        .collect();

    match strategy {
        SchemaStrategy::Strict => {
            let wanted: BTreeSet<&str> = [ID_COLUMN, TIMESTAMP_COLUMN]
                .into_iter()
                .chain(expected.iter().map(|c| c.name.as_str()))
                .collect();
            if wanted == existing {
                SchemaPlan::UpToDate
            } else {
                SchemaPlan::Recreate
            }
        }
        SchemaStrategy::Additive if missing.is_empty() => SchemaPlan::UpToDate,
        SchemaStrategy::Additive => SchemaPlan::AddColumns(missing),
    }
}

pub fn create_table_sql(table: &str, columns: &[Column]) -> String {
    let mut defs = vec![
        format!("{} SERIAL PRIMARY KEY", quote_ident(ID_COLUMN)),
        format!("{} TIMESTAMP", quote_ident(TIMESTAMP_COLUMN)),
    ];
    defs.extend(
        columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type())),
    );
    format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "))
}

pub fn add_column_sql(table: &str, column: &Column) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(table),
        quote_ident(&column.name),
        column.kind.sql_type()
    )
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table))
}

/// `INSERT` with the timestamp as `$1` followed by `columns`.
pub fn insert_sql(table: &str, columns: &[Column]) -> String {
    let names: Vec<String> = std::iter::once(TIMESTAMP_COLUMN)
        .chain(columns.iter().map(|c| c.name.as_str()))
        .map(quote_ident)
        .collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        placeholders.join(", ")
    )
}

/// Columns of the wide layout, paired with the pivot column feeding each.
/// Names that collide after sanitizing keep the first occurrence.
pub fn wide_columns(table: &PivotTable) -> Vec<(String, Column)> {
    let mut seen: BTreeSet<String> = [ID_COLUMN, TIMESTAMP_COLUMN]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut out = vec![(
        SECTION_COLUMN.to_string(),
        Column::new(SECTION_COLUMN, ColumnKind::Text),
    )];
    seen.insert(SECTION_COLUMN.to_string());

    for source in &table.columns {
        let name = sanitize_column(source);
        if !seen.insert(name.clone()) {
            warn!(
                "register {:?} maps to column {:?} which is already taken, skipping",
                source, name
            );
            continue;
        }
        let kind = if table.text_columns.contains(source) {
            ColumnKind::Text
        } else {
            ColumnKind::Float
        };
        out.push((source.clone(), Column { name, kind }));
    }
    out
}

pub fn narrow_columns() -> Vec<Column> {
    vec![
        Column::new("register", ColumnKind::Integer),
        Column::new("section", ColumnKind::Text),
        Column::new("name", ColumnKind::Text),
        Column::new("value", ColumnKind::Float),
        Column::new("value_text", ColumnKind::Text),
        Column::new("unit", ColumnKind::Text),
    ]
}

/// A single bound parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlCell {
    Float(Option<f64>),
    Integer(i32),
    Text(Option<String>),
}

impl SqlCell {
    /// Converts a decoded value for a column of the given kind; a text value
    /// in a numeric column becomes NULL.
    pub fn for_column(kind: ColumnKind, value: &Option<Value>) -> SqlCell {
        match (kind, value) {
            (ColumnKind::Text, Some(Value::Text(t))) => SqlCell::Text(Some(t.clone())),
            (ColumnKind::Text, Some(Value::Number(n))) => SqlCell::Text(Some(n.to_string())),
            (ColumnKind::Text, None) => SqlCell::Text(None),
            (_, Some(Value::Number(n))) => SqlCell::Float(Some(*n)),
            (_, Some(Value::Text(t))) => {
                warn!("non-numeric value {:?} in a numeric column, storing NULL", t);
                SqlCell::Float(None)
            }
            (_, None) => SqlCell::Float(None),
        }
    }

    fn boxed(self) -> Box<dyn ToSql + Sync> {
        match self {
            SqlCell::Float(v) => Box::new(v),
            SqlCell::Integer(v) => Box::new(v),
            SqlCell::Text(v) => Box::new(v),
        }
    }
}

fn wide_row_cells(row: &PivotRow, columns: &[(String, Column)]) -> Vec<SqlCell> {
    columns
        .iter()
        .map(|(source, col)| {
            if source == SECTION_COLUMN {
                SqlCell::Text(Some(row.section.clone()))
            } else {
                let value = row.cells.get(source).cloned().flatten();
                SqlCell::for_column(col.kind, &value)
            }
        })
        .collect()
}

fn narrow_row_cells(r: &DecodedReading) -> Vec<SqlCell> {
    let (value, value_text) = match &r.value {
        Some(Value::Number(n)) => (Some(*n), None),
        Some(Value::Text(t)) => (None, Some(t.clone())),
        None => (None, None),
    };
    vec![
        SqlCell::Integer(r.address as i32),
        SqlCell::Text(Some(r.section.clone())),
        SqlCell::Text(Some(r.name.clone())),
        SqlCell::Float(value),
        SqlCell::Text(value_text),
        SqlCell::Text(Some(r.unit.clone())),
    ]
}

fn execute<C: GenericClient>(
    client: &mut C,
    query: &str,
    timestamp: Option<NaiveDateTime>,
    cells: Vec<SqlCell>,
) -> Result<u64> {
    let mut params: Vec<Box<dyn ToSql + Sync>> = vec![];
    if let Some(ts) = timestamp {
        params.push(Box::new(ts));
    }
    params.extend(cells.into_iter().map(SqlCell::boxed));
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();
    client.execute(query, &refs).map_err(|e| {
        error!("SQL error, query={:?}, error: {}", query, e);
        PollError::database(query, e)
    })
}

/// Current column names of `table`, `None` when it does not exist.
fn existing_columns<C: GenericClient>(client: &mut C, table: &str) -> Result<Option<Vec<String>>> {
    let query = "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position";
    let rows = client.query(query, &[&table]).map_err(|e| {
        error!("SQL error, query={:?}, error: {}", query, e);
        PollError::database(query, e)
    })?;
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(rows.iter().map(|row| row.get(0)).collect()))
}

/// Brings `table` in line with `expected` and reports what was done.
pub fn ensure_schema<C: GenericClient>(
    client: &mut C,
    table: &str,
    expected: &[Column],
    strategy: SchemaStrategy,
) -> Result<SchemaPlan> {
    let existing = existing_columns(client, table)?;
    let plan = plan_schema(existing.as_deref(), expected, strategy);
    match &plan {
        SchemaPlan::UpToDate => debug!("{}: schema up to date", table),
        SchemaPlan::Create => {
            info!("🦏 {}: creating table with {} columns", table, expected.len());
            execute(client, &create_table_sql(table, expected), None, vec![])?;
        }
        SchemaPlan::Recreate => {
            warn!("🦏 {}: column set changed, dropping and recreating table", table);
            execute(client, &drop_table_sql(table), None, vec![])?;
            execute(client, &create_table_sql(table, expected), None, vec![])?;
        }
        SchemaPlan::AddColumns(missing) => {
            for col in missing {
                info!("🦏 {}: adding column {:?}", table, col.name);
                execute(client, &add_column_sql(table, col), None, vec![])?;
            }
        }
    }
    Ok(plan)
}

/// PostgreSQL sink. Every stored pass is one transaction.
pub struct PgSink {
    client: postgres::Client,
    table: String,
    layout: TableLayout,
    strategy: SchemaStrategy,
}

impl PgSink {
    pub fn connect(conf: &PostgresConfig) -> Result<Self> {
        let pg_config = conf.client_config()?;
        let mut builder = SslConnector::builder(SslMethod::tls())
            .map_err(|e| PollError::Sink(format!("SslConnector::builder error: {}", e)))?;
        builder.set_verify(SslVerifyMode::NONE); //allow self-signed certificates
        let connector = MakeTlsConnector::new(builder.build());

        info!(
            "🦏 connecting to database {:?} on {:?}...",
            conf.dbname.as_deref().unwrap_or_default(),
            conf.host.as_deref().unwrap_or_default()
        );
        let client = pg_config.connect(connector).map_err(|e| {
            error!("PostgreSQL connection error: {:?}", e);
            PollError::database("connect", e)
        })?;
        info!("connected successfully");

        Ok(PgSink {
            client,
            table: sanitize_column(&conf.table),
            layout: conf.layout,
            strategy: conf.schema,
        })
    }

    /// Stores a pass in the configured layout; returns inserted row count.
    pub fn store_pass(&mut self, pass: &PollPass) -> Result<u64> {
        match self.layout {
            TableLayout::Wide => {
                let table = PivotTable::from_readings(&pass.readings);
                self.store_pivot(pass.timestamp, &table)
            }
            TableLayout::Narrow => self.store_narrow(pass),
        }
    }

    /// One row per pivoted section, all stamped with `timestamp`.
    pub fn store_pivot(&mut self, timestamp: NaiveDateTime, table: &PivotTable) -> Result<u64> {
        let columns = wide_columns(table);
        let expected: Vec<Column> = columns.iter().map(|(_, c)| c.clone()).collect();
        let query = insert_sql(&self.table, &expected);

        let mut tx = self
            .client
            .transaction()
            .map_err(|e| PollError::database("BEGIN", e))?;
        ensure_schema(&mut tx, &self.table, &expected, self.strategy)?;
        let mut inserted = 0;
        for row in &table.rows {
            inserted += execute(&mut tx, &query, Some(timestamp), wide_row_cells(row, &columns))?;
        }
        tx.commit().map_err(|e| PollError::database("COMMIT", e))?;
        info!("🦏 {}: inserted {} rows", self.table, inserted);
        Ok(inserted)
    }

    fn store_narrow(&mut self, pass: &PollPass) -> Result<u64> {
        let expected = narrow_columns();
        let query = insert_sql(&self.table, &expected);

        let mut tx = self
            .client
            .transaction()
            .map_err(|e| PollError::database("BEGIN", e))?;
        ensure_schema(&mut tx, &self.table, &expected, self.strategy)?;
        let mut inserted = 0;
        for r in &pass.readings {
            inserted += execute(&mut tx, &query, Some(pass.timestamp), narrow_row_cells(r))?;
        }
        tx.commit().map_err(|e| PollError::database("COMMIT", e))?;
        info!("🦏 {}: inserted {} rows", self.table, inserted);
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RegisterType;
    use std::collections::BTreeMap;

    fn names(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn column_names_are_sanitized() {
        assert_eq!(sanitize_column("PV1_Voltage"), "PV1_Voltage");
        assert_eq!(sanitize_column("  Grid  Frequency (Hz) "), "Grid_Frequency_Hz");
        assert_eq!(sanitize_column("1st stage"), "c_1st_stage");
        assert_eq!(sanitize_column("电压"), "unnamed");
        assert_eq!(sanitize_column("--"), "unnamed");
        let long = "x".repeat(100);
        assert_eq!(sanitize_column(&long).len(), MAX_IDENTIFIER_LEN);
        assert_eq!(sanitize_column("a\"b"), "a_b");
    }

    #[test]
    fn missing_table_is_created() {
        let expected = vec![Column::new("a", ColumnKind::Float)];
        assert_eq!(
            plan_schema(None, &expected, SchemaStrategy::Additive),
            SchemaPlan::Create
        );
        assert_eq!(
            plan_schema(None, &expected, SchemaStrategy::Strict),
            SchemaPlan::Create
        );
    }

    #[test]
    fn additive_adds_exactly_the_missing_column() {
        let existing = names(&["id", "timestamp", "section", "a", "old"]);
        let expected = vec![
            Column::new("section", ColumnKind::Text),
            Column::new("a", ColumnKind::Float),
            Column::new("b", ColumnKind::Float),
        ];
        assert_eq!(
            plan_schema(Some(&existing), &expected, SchemaStrategy::Additive),
            SchemaPlan::AddColumns(vec![Column::new("b", ColumnKind::Float)])
        );
        assert_eq!(
            plan_schema(Some(&existing), &expected[..2], SchemaStrategy::Additive),
            SchemaPlan::UpToDate
        );
    }

    #[test]
    fn strict_recreates_on_any_drift() {
        let existing = names(&["id", "timestamp", "a"]);
        let same = vec![Column::new("a", ColumnKind::Float)];
        assert_eq!(
            plan_schema(Some(&existing), &same, SchemaStrategy::Strict),
            SchemaPlan::UpToDate
        );
        assert_eq!(
            plan_schema(Some(&existing), &[], SchemaStrategy::Strict),
            SchemaPlan::Recreate
        );
        let more = vec![
            Column::new("a", ColumnKind::Float),
            Column::new("b", ColumnKind::Float),
        ];
        assert_eq!(
            plan_schema(Some(&existing), &more, SchemaStrategy::Strict),
            SchemaPlan::Recreate
        );
    }

    #[test]
    fn sql_builders() {
        let cols = vec![
            Column::new("section", ColumnKind::Text),
            Column::new("PV1_Voltage", ColumnKind::Float),
        ];
        assert_eq!(
            create_table_sql("inverter_data", &cols),
            "CREATE TABLE \"inverter_data\" (\"id\" SERIAL PRIMARY KEY, \"timestamp\" TIMESTAMP, \
             \"section\" TEXT, \"PV1_Voltage\" DOUBLE PRECISION)"
        );
        assert_eq!(
            add_column_sql("inverter_data", &cols[1]),
            "ALTER TABLE \"inverter_data\" ADD COLUMN \"PV1_Voltage\" DOUBLE PRECISION"
        );
        assert_eq!(
            insert_sql("inverter_data", &cols),
            "INSERT INTO \"inverter_data\" (\"timestamp\", \"section\", \"PV1_Voltage\") VALUES ($1, $2, $3)"
        );
        assert_eq!(
            drop_table_sql("inverter_data"),
            "DROP TABLE IF EXISTS \"inverter_data\""
        );
    }

    #[test]
    fn wide_columns_follow_the_pivot() {
        let table = PivotTable {
            columns: names(&["Model", "PV1 Voltage", "PV1-Voltage", "timestamp"]),
            rows: vec![],
            text_columns: ["Model".to_string()].into_iter().collect(),
        };
        let cols = wide_columns(&table);
        let got: Vec<(&str, &str, ColumnKind)> = cols
            .iter()
            .map(|(s, c)| (s.as_str(), c.name.as_str(), c.kind))
            .collect();
        assert_eq!(
            got,
            vec![
                ("section", "section", ColumnKind::Text),
                ("Model", "Model", ColumnKind::Text),
                ("PV1 Voltage", "PV1_Voltage", ColumnKind::Float),
            ]
        );
    }

    #[test]
    fn wide_cells_match_columns() {
        let table = PivotTable {
            columns: names(&["Model", "PV1_Voltage", "PV2_Voltage"]),
            rows: vec![],
            text_columns: ["Model".to_string()].into_iter().collect(),
        };
        let mut cells = BTreeMap::new();
        cells.insert("Model".to_string(), Some(Value::Text("SF4ES".into())));
        cells.insert("PV1_Voltage".to_string(), Some(Value::Number(120.5)));
        let row = PivotRow {
            section: "PV".into(),
            cells,
        };
        assert_eq!(
            wide_row_cells(&row, &wide_columns(&table)),
            vec![
                SqlCell::Text(Some("PV".into())),
                SqlCell::Text(Some("SF4ES".into())),
                SqlCell::Float(Some(120.5)),
                SqlCell::Float(None),
            ]
        );
    }

    #[test]
    fn cell_conversion() {
        assert_eq!(
            SqlCell::for_column(ColumnKind::Float, &Some(Value::Text("x".into()))),
            SqlCell::Float(None)
        );
        assert_eq!(
            SqlCell::for_column(ColumnKind::Text, &Some(Value::Number(1.5))),
            SqlCell::Text(Some("1.5".into()))
        );
    }

    #[test]
    fn narrow_cells() {
        let r = DecodedReading {
            address: 0x0600,
            name: "Model".into(),
            section: "Info".into(),
            value: Some(Value::Text("SF".into())),
            unit: String::new(),
            kind: RegisterType::Ascii,
        };
        let cells = narrow_row_cells(&r);
        assert_eq!(cells.len(), narrow_columns().len());
        assert_eq!(cells[0], SqlCell::Integer(0x0600));
        assert_eq!(cells[3], SqlCell::Float(None));
        assert_eq!(cells[4], SqlCell::Text(Some("SF".into())));
    }
}
