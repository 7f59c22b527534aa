//! Error types of the programmer library.

use std::fmt;

use thiserror::Error;

/// Memory region of a PIC chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Rom,
    Eeprom,
    Config,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Rom => write!(f, "ROM"),
            Region::Eeprom => write!(f, "EEPROM"),
            Region::Config => write!(f, "config"),
        }
    }
}

/// Why a HEX record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexFault {
    BadChecksum { expected: u8, found: u8 },
    UnknownType(u8),
    AddressOutOfRange(u32),
    /// Any other syntax problem reported by the record reader.
    Syntax(String),
}

impl fmt::Display for HexFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexFault::BadChecksum { expected, found } => {
                write!(f, "checksum 0x{:02x}, expected 0x{:02x}", found, expected)
            }
            HexFault::UnknownType(t) => write!(f, "unsupported record type 0x{:02x}", t),
            HexFault::AddressOutOfRange(addr) => {
                write!(f, "address 0x{:06x} is outside every memory window", addr)
            }
            HexFault::Syntax(msg) => write!(f, "{}", msg),
        }
    }
}

/// A workflow step, used to localize failures and report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Connect,
    CheckChipId,
    EnterProgrammingMode,
    Erase,
    WriteRom,
    WriteEeprom,
    WriteConfig,
    WriteCalibration,
    ReadRom,
    ReadEeprom,
    ReadConfig,
    CommitFuses,
    ExitProgrammingMode,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Connect => "connect",
            Step::CheckChipId => "check chip id",
            Step::EnterProgrammingMode => "enter programming mode",
            Step::Erase => "erase",
            Step::WriteRom => "write ROM",
            Step::WriteEeprom => "write EEPROM",
            Step::WriteConfig => "write ID and fuses",
            Step::WriteCalibration => "write calibration",
            Step::ReadRom => "read ROM",
            Step::ReadEeprom => "read EEPROM",
            Step::ReadConfig => "read config",
            Step::CommitFuses => "commit fuses",
            Step::ExitProgrammingMode => "exit programming mode",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown chip type \"{0}\"")]
    UnknownChipType(String),

    #[error("chip {chip} has no fuse named \"{field}\"")]
    UnknownFuse { chip: String, field: String },

    #[error("invalid setting \"{value}\" for fuse \"{field}\"")]
    InvalidFuseValue { field: String, value: String },

    #[error("cannot identify the setting of fuse \"{0}\"")]
    UndecodableFuse(String),

    #[error("malformed HEX record #{record}: {reason}")]
    MalformedHex { record: usize, reason: HexFault },

    #[error("invalid memory image: {0}")]
    InvalidImage(String),

    #[error("chip database: {0}")]
    ChipDatabase(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error in {operation}: expected {expected}, received {observed}")]
    Protocol {
        operation: &'static str,
        expected: String,
        observed: String,
    },

    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("programming {region} failed at address 0x{address:04x}")]
    ProgrammingFailure { region: Region, address: u32 },

    #[error("chip reports id 0x{found:04x}, {chip} expects 0x{expected:04x}")]
    ChipIdMismatch {
        chip: String,
        expected: u16,
        found: u16,
    },

    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification, used for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, detected before any device I/O.
    Validation,
    /// Connection or protocol failure.
    Device,
    /// The chip did not take the data, or verification failed.
    Programming,
    Other,
}

impl Error {
    pub fn protocol(operation: &'static str, expected: impl fmt::Debug, observed: &[u8]) -> Self {
        let observed = if observed.is_empty() {
            "nothing (timeout)".to_string()
        } else {
            format!("{:?}", String::from_utf8_lossy(observed))
        };
        Error::Protocol {
            operation,
            expected: format!("{:?}", expected),
            observed,
        }
    }

    /// Attach the workflow step at which this error surfaced.
    pub fn at(self, step: Step) -> Self {
        match self {
            e @ (Error::Step { .. } | Error::Cancelled) => e,
            e => Error::Step {
                step,
                source: Box::new(e),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownChipType(_)
            | Error::UnknownFuse { .. }
            | Error::InvalidFuseValue { .. }
            | Error::UndecodableFuse(_)
            | Error::MalformedHex { .. }
            | Error::InvalidImage(_) => ErrorKind::Validation,
            Error::Connection(_)
            | Error::Protocol { .. }
            | Error::InvalidState { .. }
            | Error::Serial(_) => ErrorKind::Device,
            Error::ProgrammingFailure { .. } | Error::ChipIdMismatch { .. } => {
                ErrorKind::Programming
            }
            Error::Step { source, .. } => source.kind(),
            Error::ChipDatabase(_) | Error::Cancelled | Error::Io(_) => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_context_keeps_kind() {
        let err = Error::ProgrammingFailure {
            region: Region::Rom,
            address: 0x12,
        }
        .at(Step::WriteRom);
        assert_eq!(err.kind(), ErrorKind::Programming);
        assert_eq!(
            err.to_string(),
            "write ROM failed: programming ROM failed at address 0x0012"
        );
        // a second step does not wrap again
        assert!(matches!(
            err.at(Step::Erase),
            Error::Step {
                step: Step::WriteRom,
                ..
            }
        ));
    }

    #[test]
    fn timeout_is_reported_as_nothing() {
        let err = Error::protocol("command end", 'Q', &[]);
        assert_eq!(
            err.to_string(),
            "protocol error in command end: expected 'Q', received nothing (timeout)"
        );
    }
}
