use crate::session::DecodedReading;
use std::collections::BTreeSet;
use std::io::{self, Write};

#[derive(Clone, Debug, Default)]
pub struct ConsoleOptions {
    /// Hide readings whose value is exactly zero.
    pub zero_suppress: bool,
    /// Addresses printed even when zero.
    pub always_report: BTreeSet<u16>,
}

fn visible(r: &DecodedReading, opts: &ConsoleOptions) -> bool {
    !opts.zero_suppress
        || opts.always_report.contains(&r.address)
        || !r.value.as_ref().map_or(false, |v| v.is_zero())
}

/// Prints readings grouped under `--- section ---` headers.
pub fn render<W: Write>(readings: &[DecodedReading], opts: &ConsoleOptions, mut out: W) -> io::Result<()> {
    let mut current_section: Option<&str> = None;
    for r in readings.iter().filter(|r| visible(r, opts)) {
        if current_section != Some(r.section.as_str()) {
            current_section = Some(r.section.as_str());
            writeln!(out, "\n--- {} ---", r.section)?;
        }
        match &r.value {
            Some(v) => writeln!(
                out,
                "0x{:04X}: {} ({}) - {} : {}",
                r.address, r.name, r.kind, r.unit, v
            )?,
            None => writeln!(
                out,
                "0x{:04X}: {} ({}) - {} : Unable to decode value",
                r.address, r.name, r.kind, r.unit
            )?,
        }
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{RegisterType, Value};

    fn reading(address: u16, section: &str, value: Option<Value>) -> DecodedReading {
        DecodedReading {
            address,
            name: format!("R{:X}", address),
            section: section.into(),
            value,
            unit: "V".into(),
            kind: RegisterType::U16,
        }
    }

    fn rendered(readings: &[DecodedReading], opts: &ConsoleOptions) -> String {
        let mut buf = vec![];
        render(readings, opts, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn section_breaks_and_formats() {
        let readings = vec![
            reading(0x0580, "PV", Some(Value::Number(120.5))),
            reading(0x0581, "PV", None),
            reading(0x0600, "Grid", Some(Value::Text("AB".into()))),
        ];
        assert_eq!(
            rendered(&readings, &ConsoleOptions::default()),
            "\n--- PV ---\n\
             0x0580: R580 (U16) - V : 120.5000\n\
             0x0581: R581 (U16) - V : Unable to decode value\n\
             \n--- Grid ---\n\
             0x0600: R600 (U16) - V : \"AB\"\n"
        );
    }

    #[test]
    fn zero_suppression_with_allow_list() {
        let readings = vec![
            reading(0x0001, "S", Some(Value::Number(0.0))),
            reading(0x0002, "S", Some(Value::Number(0.0))),
            reading(0x0003, "S", Some(Value::Number(1.0))),
            reading(0x0004, "S", None),
        ];
        let opts = ConsoleOptions {
            zero_suppress: true,
            always_report: [0x0002].into_iter().collect(),
        };
        let out = rendered(&readings, &opts);
        assert!(!out.contains("0x0001"));
        assert!(out.contains("0x0002"));
        assert!(out.contains("0x0003"));
        assert!(out.contains("0x0004"));

        let all = rendered(&readings, &ConsoleOptions::default());
        assert!(all.contains("0x0001"));
    }
}
