use crate::decode::RegisterType;
use crate::error::{PollError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

pub const DEFAULT_MAX_REGISTER: u16 = 0x1324;

static CHANNEL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bPV\s*[nx]\b").expect("Invalid channel marker regex"));
static CHANNEL_STRIDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:stride|step|every)\s*[:=]?\s*(\d+)").expect("Invalid stride regex")
});

/// One logical register, after range expansion.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterDefinition {
    pub address: u16,
    pub end_address: u16,
    pub section: String,
    pub name: String,
    pub kind: RegisterType,
    pub accuracy: f64,
    pub unit: String,
}

/// Role of a column in the register description file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnRole {
    Section,
    Address,
    Name,
    Type,
    Accuracy,
    Unit,
}

/// Maps column roles to positions within a CSV row.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnLayout {
    roles: Vec<Option<ColumnRole>>,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        ColumnLayout {
            roles: vec![
                Some(ColumnRole::Section),
                Some(ColumnRole::Address),
                Some(ColumnRole::Name),
                Some(ColumnRole::Type),
                Some(ColumnRole::Accuracy),
                Some(ColumnRole::Unit),
            ],
        }
    }
}

impl ColumnLayout {
    /// Parses a list such as `section,address,name,-,type,accuracy,unit`
    /// where `-` marks a column to ignore.
    pub fn parse(list: &str) -> Result<ColumnLayout> {
        let mut roles = vec![];
        for token in list.split(',').map(|t| t.trim().to_lowercase()) {
            let role = match token.as_str() {
                "section" | "function" => Some(ColumnRole::Section),
                "address" => Some(ColumnRole::Address),
                "name" => Some(ColumnRole::Name),
                "type" => Some(ColumnRole::Type),
                "accuracy" => Some(ColumnRole::Accuracy),
                "unit" => Some(ColumnRole::Unit),
                "-" | "" => None,
                other => {
                    return Err(PollError::Config(format!(
                        "unknown register file column role {:?}",
                        other
                    )))
                }
            };
            if role.is_some() && roles.contains(&role) {
                return Err(PollError::Config(format!(
                    "column role {:?} given twice",
                    token
                )));
            }
            roles.push(role);
        }
        if !roles.contains(&Some(ColumnRole::Address)) {
            return Err(PollError::Config(
                "register file columns must include `address`".into(),
            ));
        }
        Ok(ColumnLayout { roles })
    }

    fn field<'a>(&self, row: &'a csv::StringRecord, role: ColumnRole) -> &'a str {
        self.roles
            .iter()
            .position(|r| *r == Some(role))
            .and_then(|i| row.get(i))
            .unwrap_or("")
    }
}

/// Quantity carried by one field of a multi-channel register group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
    Power,
}

impl Quantity {
    pub fn label(&self) -> &'static str {
        match self {
            Quantity::Voltage => "Voltage",
            Quantity::Current => "Current",
            Quantity::Power => "Power",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "A",
            Quantity::Power => "kW",
        }
    }
}

/// Repeated per-channel layout of a register range: every `stride`
/// registers a new channel starts, and the first fields of each channel
/// carry `quantities` in order.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSpec {
    pub stride: u16,
    pub quantities: Vec<Quantity>,
}

impl ChannelSpec {
    /// Guesses a channel layout from a free-text register name such as
    /// `PVn voltage, current, power (stride 3)`.
    ///
    /// The rule is a heuristic over hand-written names and only fires when
    /// both a `PVn`/`PVx` marker and a stride indicator are present.
    pub fn detect(name: &str) -> Option<ChannelSpec> {
        if !CHANNEL_MARKER.is_match(name) {
            return None;
        }
        let stride: u16 = CHANNEL_STRIDE.captures(name)?.get(1)?.as_str().parse().ok()?;
        if stride == 0 {
            return None;
        }

        let lower = name.to_lowercase();
        let mut found: Vec<(usize, Quantity)> = [
            ("volt", Quantity::Voltage),
            ("current", Quantity::Current),
            ("power", Quantity::Power),
        ]
        .iter()
        .filter_map(|(needle, q)| lower.find(needle).map(|pos| (pos, *q)))
        .collect();
        found.sort_by_key(|(pos, _)| *pos);

        Some(ChannelSpec {
            stride,
            quantities: found.into_iter().map(|(_, q)| q).collect(),
        })
    }

    /// Name and unit for `address` inside a range starting at `start`.
    pub fn name_for(&self, base: &str, unit: &str, start: u16, address: u16) -> (String, String) {
        let offset = address - start;
        let channel = offset / self.stride + 1;
        let field = (offset % self.stride) as usize;
        match self.quantities.get(field) {
            Some(q) => (format!("{}_PV{}", q.label(), channel), q.unit().to_string()),
            None => (format!("{}_PV{}_{}", base, channel, field), unit.to_string()),
        }
    }
}

/// Register definitions indexed by address.
#[derive(Clone, Debug)]
pub struct RegisterMap {
    registers: BTreeMap<u16, RegisterDefinition>,
    max_register: u16,
}

impl RegisterMap {
    pub fn new(max_register: u16) -> Self {
        RegisterMap {
            registers: BTreeMap::new(),
            max_register,
        }
    }

    pub fn get(&self, address: u16) -> Option<&RegisterDefinition> {
        self.registers.get(&address)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn max_register(&self) -> u16 {
        self.max_register
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.values()
    }

    /// Expands `def` over its address range; addresses beyond the device
    /// bound are dropped. Returns the number of registers stored.
    pub fn insert_range(&mut self, def: &RegisterDefinition) -> usize {
        let mut stored = 0;
        for address in def.address..=def.end_address {
            if address > self.max_register {
                break;
            }
            self.registers.insert(
                address,
                RegisterDefinition {
                    address,
                    ..def.clone()
                },
            );
            stored += 1;
        }
        stored
    }

    /// Like [`insert_range`](Self::insert_range) but gives every address a
    /// per-channel name and unit.
    pub fn insert_channels(&mut self, def: &RegisterDefinition, channels: &ChannelSpec) -> usize {
        let mut stored = 0;
        for address in def.address..=def.end_address {
            if address > self.max_register {
                break;
            }
            let (name, unit) = channels.name_for(&def.name, &def.unit, def.address, address);
            self.registers.insert(
                address,
                RegisterDefinition {
                    address,
                    name,
                    unit,
                    ..def.clone()
                },
            );
            stored += 1;
        }
        stored
    }
}

fn parse_hex(s: &str, raw: &str) -> Result<u16> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(s, 16).map_err(|_| PollError::MalformedAddressRange(raw.to_string()))
}

/// Parses the address column: `AAAA____BBBB`, `AAAA--BBBB`, `AAAA___BBBB`,
/// `AAAA_BBBB`, `AAAA-BBBB` (`AAAA-` meaning a single register) or `AAAA`.
/// Each endpoint may carry a `0x` prefix.
pub fn parse_address_range(raw: &str) -> Result<(u16, u16)> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err(PollError::MalformedAddressRange(raw.to_string()));
    }

    let (start, end) = if let Some((a, b)) = ["____", "--", "___", "_"]
        .iter()
        .find_map(|sep| s.split_once(sep))
    {
        (parse_hex(a, raw)?, parse_hex(b, raw)?)
    } else if let Some((a, b)) = s.split_once('-') {
        let start = parse_hex(a, raw)?;
        let end = if b.is_empty() { start } else { parse_hex(b, raw)? };
        (start, end)
    } else {
        let single = parse_hex(&s, raw)?;
        (single, single)
    };

    if start > end {
        return Err(PollError::MalformedAddressRange(raw.to_string()));
    }
    Ok((start, end))
}

/// Scale factor from a free-text field: `0,1` and `0.1V` both give 0.1,
/// anything unparseable gives 1.0.
pub fn parse_accuracy(raw: &str) -> f64 {
    let cleaned: String = raw
        .replace(',', ".")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.parse().unwrap_or(1.0)
}

fn parse_type(raw: &str, line: u64) -> RegisterType {
    let t = raw.trim();
    if t.is_empty() {
        return RegisterType::U16;
    }
    match RegisterType::parse(t) {
        Some(kind) => kind,
        None => {
            warn!(
                "line {}: unrecognized register type {:?}, assuming U16",
                line, t
            );
            RegisterType::U16
        }
    }
}

/// Loads the semicolon-delimited register description file.
pub fn load(path: &Path, layout: &ColumnLayout, max_register: u16) -> Result<RegisterMap> {
    let file = File::open(path).map_err(|e| PollError::RegisterFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    load_from_reader(file, layout, max_register).map_err(|e| match e {
        PollError::Csv(e) => PollError::RegisterFile {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        },
        other => other,
    })
}

pub fn load_from_reader<R: io::Read>(
    reader: R,
    layout: &ColumnLayout,
    max_register: u16,
) -> Result<RegisterMap> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut map = RegisterMap::new(max_register);
    let mut section = String::new();
    let mut skipped = 0;

    for record in rdr.byte_records() {
        let raw = record?;
        let line = raw.position().map(|p| p.line()).unwrap_or_default();
        if std::str::from_utf8(raw.as_slice()).is_err() {
            warn!("line {}: row is not valid UTF-8, decoding lossily", line);
        }
        let row = csv::StringRecord::from_byte_record_lossy(raw);
        let address = layout.field(&row, ColumnRole::Address);
        let label = layout.field(&row, ColumnRole::Section).trim();

        if address.trim().is_empty() {
            if !label.is_empty() {
                debug!("line {}: new section {:?}", line, label);
                section = label.to_string();
            }
            continue;
        }

        let name = layout.field(&row, ColumnRole::Name).trim();
        let (start, end) = match parse_address_range(address) {
            Ok(range) => range,
            Err(e) => {
                warn!("line {}: {} for {:?}, row skipped", line, e, name);
                skipped += 1;
                continue;
            }
        };

        let def = RegisterDefinition {
            address: start,
            end_address: end,
            section: section.clone(),
            name: name.to_string(),
            kind: parse_type(layout.field(&row, ColumnRole::Type), line),
            accuracy: parse_accuracy(layout.field(&row, ColumnRole::Accuracy)),
            unit: layout.field(&row, ColumnRole::Unit).trim().to_string(),
        };

        let channels = if end > start {
            ChannelSpec::detect(name)
        } else {
            None
        };
        match channels {
            Some(group) => {
                debug!(
                    "line {}: {:?} expanded as {} channel group(s) of stride {}",
                    line,
                    name,
                    (end - start) / group.stride + 1,
                    group.stride
                );
                map.insert_channels(&def, &group);
            }
            None => {
                map.insert_range(&def);
            }
        }
    }

    info!(
        "🗂 loaded {} register definitions up to 0x{:04X} ({} rows skipped)",
        map.len(),
        map.max_register(),
        skipped
    );
    Ok(map)
}
