//! frame model for the packet-bbs link engine

use thiserror::Error;

pub mod frame;
pub mod types;

pub use frame::{Control, Frame, SEQ_MODULUS};
pub use types::{Callsign, ProtocolId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,

    #[error("invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("invalid SSID {0}")]
    InvalidSsid(u8),

    #[error("malformed address field")]
    InvalidAddress,

    #[error("too many digipeaters ({0})")]
    TooManyDigipeaters(usize),

    #[error("unsupported control byte {0:#04x}")]
    UnsupportedControl(u8),

    #[error("PID present on a frame kind that carries none, or missing")]
    PidMismatch,
}
