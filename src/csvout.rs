use crate::decode::Value;
use crate::error::{PollError, Result};
use crate::pivot::{cell_text, parse_cell, PivotRow, PivotTable, SECTION_COLUMN};
use crate::session::PollPass;
use csv::{QuoteStyle, WriterBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize)]
struct NarrowRow<'a> {
    timestamp: String,
    register: String,
    section: &'a str,
    name: &'a str,
    value: String,
    unit: &'a str,
}

/// Writes the pivoted table, quoting every non-numeric field.
pub fn write_pivot_csv(table: &PivotTable, path: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .quote_style(QuoteStyle::NonNumeric)
        .from_path(path)?;
    wtr.write_record(table.header())?;
    for row in &table.rows {
        let mut record = vec![row.section.clone()];
        record.extend(
            table
                .columns
                .iter()
                .map(|c| row.cells.get(c).map(cell_text).unwrap_or_default()),
        );
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    info!(
        "💾 pivoted {} sections x {} registers to {}",
        table.rows.len(),
        table.columns.len(),
        path.display()
    );
    Ok(())
}

/// One row for the whole pass: timestamp then `ADDR_name` per reading.
pub fn write_wide_csv(pass: &PollPass, path: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_path(path)?;
    let header: Vec<String> = std::iter::once("Timestamp".to_string())
        .chain(
            pass.readings
                .iter()
                .map(|r| format!("{:04X}_{}", r.address, r.name)),
        )
        .collect();
    wtr.write_record(&header)?;

    let row: Vec<String> = std::iter::once(pass.timestamp.format(TIMESTAMP_FORMAT).to_string())
        .chain(pass.readings.iter().map(|r| cell_text(&r.value)))
        .collect();
    wtr.write_record(&row)?;
    wtr.flush()?;
    info!(
        "💾 wrote {} readings to {}",
        pass.readings.len(),
        path.display()
    );
    Ok(())
}

pub fn write_narrow_csv(pass: &PollPass, path: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_path(path)?;
    let timestamp = pass.timestamp.format(TIMESTAMP_FORMAT).to_string();
    for r in &pass.readings {
        wtr.serialize(NarrowRow {
            timestamp: timestamp.clone(),
            register: format!("0x{:04X}", r.address),
            section: &r.section,
            name: &r.name,
            value: cell_text(&r.value),
            unit: &r.unit,
        })?;
    }
    wtr.flush()?;
    info!(
        "💾 wrote {} readings to {}",
        pass.readings.len(),
        path.display()
    );
    Ok(())
}

/// Reads a pivoted CSV back. The first column is the section; a column
/// holding any non-numeric cell is treated as text.
pub fn read_pivot_csv(path: &Path) -> Result<PivotTable> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = rdr.headers()?.clone();
    match headers.get(0) {
        Some(first) if first.trim() == SECTION_COLUMN => {}
        other => {
            return Err(PollError::Sink(format!(
                "{}: first column must be {:?}, found {:?}",
                path.display(),
                SECTION_COLUMN,
                other.unwrap_or("")
            )))
        }
    }
    let columns: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut rows = vec![];
    let mut text_columns = BTreeSet::new();
    for record in rdr.records() {
        let record = record?;
        let section = record.get(0).unwrap_or("").to_string();
        let mut cells = BTreeMap::new();
        for (name, raw) in columns.iter().zip(record.iter().skip(1)) {
            let value = parse_cell(raw);
            if let Some(Value::Text(_)) = value {
                text_columns.insert(name.clone());
            }
            cells.insert(name.clone(), value);
        }
        rows.push(PivotRow { section, cells });
    }
    debug!(
        "{}: read {} pivoted rows, {} columns",
        path.display(),
        rows.len(),
        columns.len()
    );

    Ok(PivotTable {
        columns,
        rows,
        text_columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RegisterType;
    use crate::session::{DecodedReading, PollStats};
    use chrono::NaiveDate;
    use std::fs;

    fn pass() -> PollPass {
        let reading = |address, name: &str, section: &str, value| DecodedReading {
            address,
            name: name.into(),
            section: section.into(),
            value,
            unit: "V".into(),
            kind: RegisterType::U16,
        };
        PollPass {
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 30, 0)
                .unwrap(),
            readings: vec![
                reading(0x0580, "PV1_Voltage", "I General (RO) PV", Some(Value::Number(120.5))),
                reading(0x0581, "PV1_Current", "I General (RO) PV", None),
                reading(0x0600, "Model", "Info", Some(Value::Text("SF, 4ES".into()))),
            ],
            stats: PollStats::default(),
        }
    }

    #[test]
    fn pivot_quotes_non_numeric() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pivot.csv");
        let table = PivotTable::from_readings(&pass().readings);
        write_pivot_csv(&table, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "\"section\",\"Model\",\"PV1_Current\",\"PV1_Voltage\"");
        assert_eq!(lines[1], "\"Info\",\"SF, 4ES\",\"\",\"\"");
        assert_eq!(lines[2], "\"PV\",\"\",\"\",120.5");
    }

    #[test]
    fn pivot_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pivot.csv");
        let table = PivotTable::from_readings(&pass().readings);
        write_pivot_csv(&table, &path).unwrap();

        let back = read_pivot_csv(&path).unwrap();
        assert_eq!(back.columns, table.columns);
        assert_eq!(back.rows.len(), 2);
        assert_eq!(back.rows[1].section, "PV");
        assert_eq!(
            back.rows[1].cells.get("PV1_Voltage"),
            Some(&Some(Value::Number(120.5)))
        );
        assert_eq!(back.rows[1].cells.get("PV1_Current"), Some(&None));
        assert!(back.text_columns.contains("Model"));
        assert!(!back.text_columns.contains("PV1_Voltage"));
    }

    #[test]
    fn pivot_without_section_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "name,value\nA,1\n").unwrap();
        assert!(matches!(read_pivot_csv(&path), Err(PollError::Sink(_))));
    }

    #[test]
    fn wide_row_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.csv");
        write_wide_csv(&pass(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Timestamp,0580_PV1_Voltage,0581_PV1_Current,0600_Model\n\
             2024-05-01 12:30:00,120.5,,\"SF, 4ES\"\n"
        );
    }

    #[test]
    fn narrow_row_per_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("narrow.csv");
        write_narrow_csv(&pass(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,register,section,name,value,unit");
        assert_eq!(
            lines[1],
            "2024-05-01 12:30:00,0x0580,I General (RO) PV,PV1_Voltage,120.5,V"
        );
        assert_eq!(
            lines[2],
            "2024-05-01 12:30:00,0x0581,I General (RO) PV,PV1_Current,,V"
        );
    }
}
