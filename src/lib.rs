//! K128/K149/K150 serial PIC programmer driver.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::device::{Chip, ChipDB};
pub use self::error::{Error, ErrorKind, Region, Result, Step};
pub use self::flashing::{Flashing, Mismatch, NoProgress, Progress, VerifyReport};
pub use self::image::MemoryImage;
pub use self::protocol::{ChipConfig, Command};
pub use self::session::{Options, ProtocolRevision, Session, SessionState};
pub use self::transport::Transport;
