use std::io;
use std::path::PathBuf;

/// Everything that can go wrong during a polling pass.
///
/// Decode problems are deliberately absent: a value that cannot be decoded
/// becomes `None` in its reading and never aborts the pass.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot read register file {path:?}: {source}")]
    RegisterFile { path: PathBuf, source: io::Error },

    #[error("malformed address range: {0:?}")]
    MalformedAddressRange(String),

    #[error("cannot open serial port {port}: {source}")]
    Connect { port: String, source: io::Error },

    #[error("read of {count} register(s) at 0x{address:04X} failed: {reason}")]
    Read {
        address: u16,
        count: u16,
        reason: String,
    },

    #[error("sink error: {0}")]
    Sink(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQL error, query={query:?}: {source}")]
    Database {
        query: String,
        source: postgres::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl PollError {
    pub fn database(query: impl Into<String>, source: postgres::Error) -> Self {
        PollError::Database {
            query: query.into(),
            source,
        }
    }

    /// Process exit code for a pass aborted by this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PollError::Config(_)
            | PollError::RegisterFile { .. }
            | PollError::MalformedAddressRange(_) => 1,
            PollError::Connect { .. } | PollError::Read { .. } => 2,
            PollError::Sink(_) | PollError::Csv(_) | PollError::Database { .. } | PollError::Io(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, PollError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_failure_kinds() {
        assert_eq!(PollError::Config("x".into()).exit_code(), 1);
        let missing = PollError::RegisterFile {
            path: "regs.csv".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(missing.exit_code(), 1);
        let connect = PollError::Connect {
            port: "/dev/ttyUSB0".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
        };
        assert_eq!(connect.exit_code(), 2);
        assert_eq!(PollError::Sink("down".into()).exit_code(), 3);
    }

    #[test]
    fn read_error_mentions_hex_address() {
        let e = PollError::Read {
            address: 0x0580,
            count: 32,
            reason: "timeout".into(),
        };
        assert_eq!(
            e.to_string(),
            "read of 32 register(s) at 0x0580 failed: timeout"
        );
    }
}
