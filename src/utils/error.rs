//! Error handling for the UMDT core
//!
//! One crate-level error enum with stable discriminants. Diagnostic surfaces
//! (CLIs, GUIs) map these onto exit codes via [`UmdtError::exit_code`].

use thiserror::Error;

/// Reason a captured frame failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameReason {
    /// CRC mismatch on an RTU frame
    Crc,
    /// Stream ended or went silent mid-frame
    Truncated,
    /// Frame longer than any legal Modbus ADU
    Oversize,
    /// Function code outside the supported table
    UnknownFunction,
}

impl std::fmt::Display for FrameReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameReason::Crc => "crc",
            FrameReason::Truncated => "truncated",
            FrameReason::Oversize => "oversize",
            FrameReason::UnknownFunction => "unknown_function",
        };
        write!(f, "{s}")
    }
}

/// UMDT core error type
#[derive(Error, Debug, Clone)]
pub enum UmdtError {
    /// Caller-supplied parameter out of range or malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection refused/closed, serial port unavailable, send failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No frame boundary within the deadline
    #[error("Timeout after {after_ms} ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds
        after_ms: u64,
    },

    /// Malformed frame, captured rather than discarded
    #[error("Frame error ({reason}): {} bytes", raw.len())]
    Frame {
        /// Why validation failed
        reason: FrameReason,
        /// The bytes as received
        raw: Vec<u8>,
    },

    /// Valid reply carrying a Modbus exception code
    #[error("Modbus exception 0x{0:02X}")]
    Exception(u8),

    /// Engine shutdown or explicit cancellation
    #[error("Cancelled")]
    Cancelled,

    /// Hook failure, downgraded to pass-through by the engine
    #[error("Script error: {0}")]
    Script(String),

    /// Load-time configuration failure
    #[error("Config error in {path}: {detail}")]
    Config {
        /// File that failed to load
        path: String,
        /// What was wrong with it
        detail: String,
    },

    /// Write attempted through a passive (read-only) transport
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// File-level failure (PCAP, transaction log)
    #[error("IO error: {0}")]
    Io(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, UmdtError>;

impl UmdtError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        UmdtError::InvalidArgument(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        UmdtError::Transport(msg.into())
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        UmdtError::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn frame(reason: FrameReason, raw: impl Into<Vec<u8>>) -> Self {
        UmdtError::Frame {
            reason,
            raw: raw.into(),
        }
    }

    pub fn script(msg: impl Into<String>) -> Self {
        UmdtError::Script(msg.into())
    }

    pub fn config(path: impl Into<String>, detail: impl Into<String>) -> Self {
        UmdtError::Config {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Process exit code for CLI surfaces:
    /// 0 success, 1 generic, 2 invalid arguments, 3 transport, 4 Modbus
    /// exception, 5 timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            UmdtError::InvalidArgument(_) | UmdtError::Config { .. } => 2,
            UmdtError::Transport(_) | UmdtError::Forbidden(_) => 3,
            UmdtError::Exception(_) => 4,
            UmdtError::Timeout { .. } => 5,
            _ => 1,
        }
    }

    /// True for errors that indicate the peer answered something, however
    /// malformed, as opposed to nothing at all.
    pub fn is_reply(&self) -> bool {
        matches!(self, UmdtError::Exception(_) | UmdtError::Frame { .. })
    }
}

impl From<std::io::Error> for UmdtError {
    fn from(err: std::io::Error) -> Self {
        UmdtError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for UmdtError {
    fn from(err: serde_json::Error) -> Self {
        UmdtError::Io(format!("JSON error: {err}"))
    }
}
