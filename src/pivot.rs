use crate::decode::{RegisterType, Value};
use crate::session::DecodedReading;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

pub const SECTION_COLUMN: &str = "section";

static SECTION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^I General\s*[（(][^）)]*[）)]?\s*").expect("Invalid section prefix regex")
});

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PivotRow {
    pub section: String,
    pub cells: BTreeMap<String, Option<Value>>,
}

/// Readings of one pass reshaped to one row per section and one column per
/// register name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PivotTable {
    pub columns: Vec<String>,
    pub rows: Vec<PivotRow>,
    pub text_columns: BTreeSet<String>,
}

/// Drops the `I General (…)` prefix the Sofar register file puts in front
/// of its section labels.
pub fn strip_section_prefix(section: &str) -> String {
    SECTION_PREFIX.replace(section, "").into_owned()
}

impl PivotTable {
    pub fn from_readings(readings: &[DecodedReading]) -> Self {
        let mut columns = BTreeSet::new();
        let mut text_columns = BTreeSet::new();
        let mut rows: BTreeMap<String, BTreeMap<String, Option<Value>>> = BTreeMap::new();

        for r in readings {
            let section = strip_section_prefix(&r.section);
            columns.insert(r.name.clone());
            if r.kind == RegisterType::Ascii {
                text_columns.insert(r.name.clone());
            }
            let row = rows.entry(section.clone()).or_default();
            if row.insert(r.name.clone(), r.value.clone()).is_some() {
                warn!(
                    "duplicate register name {:?} in section {:?}, keeping 0x{:04X}",
                    r.name, section, r.address
                );
            }
        }

        PivotTable {
            columns: columns.into_iter().collect(),
            rows: rows
                .into_iter()
                .map(|(section, cells)| PivotRow { section, cells })
                .collect(),
            text_columns,
        }
    }

    /// Header as written to CSV: `section` first, then register names.
    pub fn header(&self) -> Vec<String> {
        std::iter::once(SECTION_COLUMN.to_string())
            .chain(self.columns.iter().cloned())
            .collect()
    }
}

/// Cell text for CSV output; `None` is an empty cell.
pub fn cell_text(value: &Option<Value>) -> String {
    match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Text(t)) => t.clone(),
        None => String::new(),
    }
}

/// Parses a cell read back from CSV.
pub fn parse_cell(text: &str) -> Option<Value> {
    let t = text.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("nan") {
        return None;
    }
    match t.parse::<f64>() {
        Ok(n) => Some(Value::Number(n)),
        Err(_) => Some(Value::Text(t.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(section: &str, name: &str, value: Value, kind: RegisterType) -> DecodedReading {
        DecodedReading {
            address: 0x0580,
            name: name.into(),
            section: section.into(),
            value: Some(value),
            unit: String::new(),
            kind,
        }
    }

    #[test]
    fn prefix_stripping() {
        assert_eq!(strip_section_prefix("I General (Read only) PV Input"), "PV Input");
        assert_eq!(strip_section_prefix("I General（只读）Grid"), "Grid");
        assert_eq!(strip_section_prefix("Battery"), "Battery");
    }

    #[test]
    fn pivot_by_section() {
        let readings = vec![
            reading("I General (RO) PV", "PV1_Voltage", Value::Number(120.5), RegisterType::U16),
            reading("Grid", "Frequency", Value::Number(50.0), RegisterType::U16),
            reading("I General (RO) PV", "Model", Value::Text("SF".into()), RegisterType::Ascii),
            reading("Grid", "Frequency", Value::Number(50.1), RegisterType::U16),
        ];
        let table = PivotTable::from_readings(&readings);
        assert_eq!(table.columns, vec!["Frequency", "Model", "PV1_Voltage"]);
        assert_eq!(table.header()[0], "section");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].section, "Grid");
        assert_eq!(
            table.rows[0].cells.get("Frequency"),
            Some(&Some(Value::Number(50.1)))
        );
        assert_eq!(table.rows[1].section, "PV");
        assert!(table.rows[1].cells.get("Frequency").is_none());
        assert!(table.text_columns.contains("Model"));
    }

    #[test]
    fn cells() {
        assert_eq!(cell_text(&Some(Value::Number(120.5))), "120.5");
        assert_eq!(cell_text(&None), "");
        assert_eq!(parse_cell("120.5"), Some(Value::Number(120.5)));
        assert_eq!(parse_cell(""), None);
        assert_eq!(parse_cell("SF4ES"), Some(Value::Text("SF4ES".into())));
    }
}
