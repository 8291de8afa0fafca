extern crate ini;

use self::ini::{Ini, Properties};
use postgres::config::SslMode;
use crate::error::{PollError, Result};
use crate::registers::{parse_address_range, ColumnLayout, DEFAULT_MAX_REGISTER};
use crate::session::{PollPlan, Window};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_serial::{DataBits, Parity, StopBits};

pub const DEFAULT_CONFIG_FILE: &str = "sofarpoll.conf";

/// Modbus limit for a single "read holding registers" request.
pub const MODBUS_MAX_BLOCK: u16 = 125;

#[derive(Clone, Debug, PartialEq)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub unit_id: u8,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisterFileConfig {
    pub file: PathBuf,
    pub max_register: u16,
    pub columns: ColumnLayout,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    pub plan: PollPlan,
    pub block_size: u16,
    pub block_delay: Duration,
    pub attempts: u8,
    pub zero_suppress: bool,
    pub always_report: BTreeSet<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Console,
    PivotCsv,
    WideCsv,
    NarrowCsv,
    Postgres,
}

impl SinkKind {
    pub fn parse(s: &str) -> Option<SinkKind> {
        match s.trim().to_lowercase().as_str() {
            "console" => Some(SinkKind::Console),
            "pivot-csv" | "csv" => Some(SinkKind::PivotCsv),
            "wide-csv" => Some(SinkKind::WideCsv),
            "narrow-csv" => Some(SinkKind::NarrowCsv),
            "postgres" | "db" => Some(SinkKind::Postgres),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableLayout {
    /// One row per pivoted section, one column per register name.
    Wide,
    /// One row per reading.
    Narrow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaStrategy {
    /// Add missing columns, keep everything else.
    Additive,
    /// Drop and recreate the table on any column mismatch.
    Strict,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PostgresConfig {
    pub host: Option<String>,
    pub dbname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sslmode: String,
    pub table: String,
    pub layout: TableLayout,
    pub schema: SchemaStrategy,
}

impl PostgresConfig {
    /// Connection parameters; credentials are passed as-is, never through a URL.
    pub fn client_config(&self) -> Result<postgres::Config> {
        let (host, dbname, username, password) =
            match (&self.host, &self.dbname, &self.username, &self.password) {
                (Some(h), Some(d), Some(u), Some(p)) => (h, d, u, p),
                _ => {
                    return Err(PollError::Config(
                        "postgres config is not OK: host, dbname, username and password are required"
                            .into(),
                    ))
                }
            };
        let ssl_mode = match self.sslmode.to_lowercase().as_str() {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            other => {
                return Err(PollError::Config(format!(
                    "[postgres] sslmode = {:?}: expected disable, prefer or require",
                    other
                )))
            }
        };
        let mut conf = postgres::Config::new();
        conf.host(host)
            .dbname(dbname)
            .user(username)
            .password(password)
            .ssl_mode(ssl_mode)
            .application_name("sofarpoll");
        Ok(conf)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub log_file: Option<PathBuf>,
    pub log_level: log::LevelFilter,
    pub serial: SerialConfig,
    pub registers: RegisterFileConfig,
    pub poll: PollConfig,
    pub sink: SinkKind,
    pub csv_path: PathBuf,
    pub postgres: PostgresConfig,
}

/// The five Sofar address windows, each with its population mask at the
/// start of the window.
pub fn default_windows() -> Vec<Window> {
    [0x0480, 0x0500, 0x0580, 0x0600, 0x0680]
        .iter()
        .map(|&start| Window {
            start,
            end: start + 0x3F,
            mask_address: start,
        })
        .collect()
}

struct Section<'a> {
    name: &'static str,
    props: Option<&'a Properties>,
}

impl<'a> Section<'a> {
    fn new(conf: &'a Ini, name: &'static str) -> Self {
        Section {
            name,
            props: conf.section(Some(name)),
        }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.props
            .and_then(|p| p.get(key))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn invalid(&self, key: &str, value: &str, expected: &str) -> PollError {
        PollError::Config(format!(
            "[{}] {} = {:?}: expected {}",
            self.name, key, value, expected
        ))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T, expected: &str) -> Result<T> {
        match self.get(key) {
            Some(v) => v.parse().map_err(|_| self.invalid(key, v, expected)),
            None => Ok(default),
        }
    }

    fn hex(&self, key: &str, default: u16) -> Result<u16> {
        match self.get(key) {
            Some(v) => parse_hex_address(v).ok_or_else(|| self.invalid(key, v, "a hex address")),
            None => Ok(default),
        }
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            Some(v) => humantime::parse_duration(v)
                .map_err(|_| self.invalid(key, v, "a duration such as 1s or 50ms")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(str::to_lowercase).as_deref() {
            None => Ok(default),
            Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
            Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
            Some(v) => Err(self.invalid(key, v, "a boolean")),
        }
    }
}

fn parse_hex_address(s: &str) -> Option<u16> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(s, 16).ok()
}

/// Parses `0480-04BF@0480, 0500-053F@0500`.
pub fn parse_windows(s: &str) -> Result<Vec<Window>> {
    let mut windows = vec![];
    for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        let bad = || PollError::Config(format!("invalid window {:?}, expected START-END@MASK", item));
        let (range, mask) = item.split_once('@').ok_or_else(bad)?;
        let (start, end) = parse_address_range(range).map_err(|_| bad())?;
        let mask_address = parse_hex_address(mask).ok_or_else(bad)?;
        if end - start >= 64 {
            return Err(PollError::Config(format!(
                "window {:?} is wider than its 64-bit mask",
                item
            )));
        }
        windows.push(Window {
            start,
            end,
            mask_address,
        });
    }
    if windows.is_empty() {
        return Err(PollError::Config("[poll] windows is empty".into()));
    }
    Ok(windows)
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let conf = Ini::load_from_file(path).map_err(|e| match e {
            ini::Error::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                PollError::Config(format!("config file {:?} not found", path))
            }
            e => PollError::Config(format!("cannot read config file {:?}: {}", path, e)),
        })?;
        Config::from_ini(&conf)
    }

    pub fn from_ini(conf: &Ini) -> Result<Config> {
        let general = Section::new(conf, "general");
        let serial = Section::new(conf, "serial");
        let registers = Section::new(conf, "registers");
        let poll = Section::new(conf, "poll");
        let output = Section::new(conf, "output");
        let postgres = Section::new(conf, "postgres");

        let log_level = general.parse("log_level", log::LevelFilter::Info, "a log level")?;

        let data_bits = match serial.parse("data_bits", 8u8, "5..8")? {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            n => return Err(serial.invalid("data_bits", &n.to_string(), "5..8")),
        };
        let parity = match serial.string("parity", "none").to_lowercase().as_str() {
            "none" | "n" => Parity::None,
            "even" | "e" => Parity::Even,
            "odd" | "o" => Parity::Odd,
            other => return Err(serial.invalid("parity", other, "none, even or odd")),
        };
        let stop_bits = match serial.parse("stop_bits", 1u8, "1 or 2")? {
            1 => StopBits::One,
            2 => StopBits::Two,
            n => return Err(serial.invalid("stop_bits", &n.to_string(), "1 or 2")),
        };

        let max_register = registers.hex("max_register", DEFAULT_MAX_REGISTER)?;
        let columns = match registers.get("columns") {
            Some(c) => ColumnLayout::parse(c)?,
            None => ColumnLayout::default(),
        };

        let plan = match poll.string("strategy", "mask").to_lowercase().as_str() {
            "mask" => PollPlan::Mask(match poll.get("windows") {
                Some(w) => parse_windows(w)?,
                None => default_windows(),
            }),
            "sweep" => {
                let start = poll.hex("sweep_start", 0x0040)?;
                if start > max_register {
                    return Err(poll.invalid(
                        "sweep_start",
                        &format!("{:04X}", start),
                        "an address not above max_register",
                    ));
                }
                PollPlan::Sweep {
                    start,
                    end: max_register,
                }
            }
            other => return Err(poll.invalid("strategy", other, "mask or sweep")),
        };

        let block_size: u16 = poll.parse("block_size", 32, "a register count")?;
        let attempts: u8 = poll.parse("attempts", 2, "an attempt count")?;
        let mut always_report = BTreeSet::new();
        if let Some(list) = poll.get("always_report") {
            for item in list.split(',').map(str::trim).filter(|i| !i.is_empty()) {
                let addr = parse_hex_address(item)
                    .ok_or_else(|| poll.invalid("always_report", item, "hex addresses"))?;
                always_report.insert(addr);
            }
        }

        let sink_name = output.string("sink", "console");
        let sink = SinkKind::parse(&sink_name).ok_or_else(|| {
            output.invalid(
                "sink",
                &sink_name,
                "console, pivot-csv, wide-csv, narrow-csv or postgres",
            )
        })?;

        let layout = match postgres.string("layout", "wide").to_lowercase().as_str() {
            "wide" => TableLayout::Wide,
            "narrow" => TableLayout::Narrow,
            other => return Err(postgres.invalid("layout", other, "wide or narrow")),
        };
        let schema = match postgres.string("schema", "additive").to_lowercase().as_str() {
            "additive" => SchemaStrategy::Additive,
            "strict" => SchemaStrategy::Strict,
            other => return Err(postgres.invalid("schema", other, "additive or strict")),
        };

        Ok(Config {
            log_file: general.get("log").map(PathBuf::from),
            log_level,
            serial: SerialConfig {
                port: serial.string("port", "/dev/ttyUSB0"),
                baud_rate: serial.parse("baud_rate", 9600, "a baud rate")?,
                data_bits,
                parity,
                stop_bits,
                unit_id: serial.parse("unit_id", 1, "a unit id 0..255")?,
                timeout: serial.duration("timeout", Duration::from_secs(1))?,
            },
            registers: RegisterFileConfig {
                file: PathBuf::from(registers.string("file", "sofarregister.csv")),
                max_register,
                columns,
            },
            poll: PollConfig {
                plan,
                block_size: block_size.clamp(1, MODBUS_MAX_BLOCK),
                block_delay: poll.duration("block_delay", Duration::from_millis(50))?,
                attempts: attempts.max(1),
                zero_suppress: poll.flag("zero_suppress", true)?,
                always_report,
            },
            sink,
            csv_path: PathBuf::from(output.string("csv_path", "/tmp/pivoted_registers.csv")),
            postgres: PostgresConfig {
                host: postgres.get("host").map(String::from),
                dbname: postgres.get("dbname").map(String::from),
                username: postgres.get("username").map(String::from),
                password: postgres.get("password").map(String::from),
                sslmode: postgres.string("sslmode", "prefer"),
                table: postgres.string("table", "inverter_data"),
                layout,
                schema,
            },
        })
    }
}
