//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire elements.
#[derive(Debug, Error)]
pub enum WireError {
    /// A bulk payload announced a size above the configured ceiling.
    #[error("bulk payload too large: {size} bytes (max {max})")]
    BulkTooLarge { size: u64, max: u64 },

    /// An inline command line exceeded the maximum length without a newline.
    #[error("command line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    /// The input does not parse as the expected wire element.
    #[error("malformed {context}: {reason}")]
    Malformed {
        context: &'static str,
        reason: String,
    },

    /// A request line named a command this endpoint does not serve.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

impl WireError {
    /// Convenience constructor for [`WireError::Malformed`].
    pub fn malformed(context: &'static str, reason: impl Into<String>) -> Self {
        WireError::Malformed {
            context,
            reason: reason.into(),
        }
    }

    /// Returns true if the connection cannot be resynchronized after this
    /// error and should be torn down.
    ///
    /// Framing is byte-positional, so every decode error is fatal for the
    /// connection; the peer reconnects to resynchronize.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::UnknownCommand(_))
    }
}
