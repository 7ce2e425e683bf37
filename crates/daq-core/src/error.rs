//! Error types for the acquisition core.
//!
//! Two families of failure:
//!
//! - [`DaqError`] is the application error. It travels through `?` and ends
//!   an operation: bad configuration, a channel that can no longer make
//!   progress, a request the pool refuses.
//! - [`FrameError`] is an *outcome* of scanning or decoding one message.
//!   Readers count it, log it (rate limited) and move on to the next
//!   message. It never unwinds past the reader that saw it.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment::Error` from loading TOML / environment.
//! - **`Configuration`**: Semantic validation failures (values that parse but
//!   make no sense, e.g. a zero sample rate).
//! - **`Io`**: Channel I/O that is not a transient would-block condition.
//! - **`Pool`**: Length or type validation from [`daq_pool::PoolError`].
//! - **`Channel`**: A named channel failed in a way that ends its reader.
//! - **`UnknownDecoder`** / **`DuplicateDecoder`**: registry lookups.

use daq_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Config`, `Configuration`, `UnknownDecoder`
///    - Occur at startup while building readers
///    - Recovery: fix the configuration and restart
///
/// 2. **Channel Errors** - `Io`, `Channel`
///    - Occur inside an acquisition thread
///    - Recovery: the owning control loop closes the channel and reconnects
///      with backoff; the process keeps running
///
/// 3. **Resource Errors** - `Pool`
///    - A sample request inconsistent with its element type or size limit
///    - Recovery: caller bug or bad decoder configuration; pool state is intact
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment parsing failed.
    ///
    /// **Source**: Wraps `figment::Error`.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration validation failed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use daq_core::error::DaqError;
    ///
    /// fn validate_rate(rate_hz: f64) -> Result<(), DaqError> {
    ///     if rate_hz <= 0.0 {
    ///         return Err(DaqError::Configuration(
    ///             "nominal_rate must be positive".into()
    ///         ));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Channel I/O failed with something other than would-block.
    ///
    /// **Recovery Strategy**: close the channel; the reader's owner decides
    /// whether to reconnect.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sample request rejected by the pool.
    #[error("Sample pool error: {0}")]
    Pool(#[from] PoolError),

    /// A channel can no longer make progress.
    #[error("Channel '{channel}' failed: {message}")]
    Channel { channel: String, message: String },

    /// No decoder registered under the requested class name.
    #[error("No decoder registered for sensor class '{0}'")]
    UnknownDecoder(String),

    /// A decoder class name was registered twice.
    #[error("Decoder class '{0}' is already registered")]
    DuplicateDecoder(String),

    /// Acquisition thread could not be started or joined.
    #[error("Acquisition thread '{name}': {message}")]
    Thread { name: String, message: String },
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether an I/O error is the would-block / interrupted kind that a
    /// non-blocking channel produces when it simply isn't ready.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::Io(e) if is_transient_io(e))
    }
}

/// `EAGAIN`-class I/O errors: retry later, do not fail.
#[must_use]
pub fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// Recoverable failure to turn one framed message into samples.
///
/// Counted and dropped by the reader; acquisition continues with the next
/// message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Checksum carried by the message does not match its payload.
    #[error("checksum mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    BadChecksum { expected: u32, computed: u32 },

    /// Message longer than the scanner's maximum.
    #[error("message of {length} bytes exceeds maximum {max}")]
    Oversize { length: usize, max: usize },

    /// Partial message discarded (resynchronization or short payload).
    #[error("incomplete message: {length} bytes")]
    Incomplete { length: usize },

    /// Payload that the decoder cannot interpret.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Decoder asked the pool for an impossible sample.
    #[error("sample allocation failed: {0}")]
    Pool(#[from] PoolError),
}

impl FrameError {
    /// Short label for counters and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FrameError::BadChecksum { .. } => "bad_checksum",
            FrameError::Oversize { .. } => "oversize",
            FrameError::Incomplete { .. } => "incomplete",
            FrameError::Malformed(_) => "malformed",
            FrameError::Pool(_) => "pool",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_transient_classification() {
        let would_block: DaqError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(would_block.is_transient());

        let reset: DaqError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!reset.is_transient());

        assert!(!DaqError::Configuration("x".into()).is_transient());
    }

    #[test]
    fn test_pool_error_converts() {
        let err: DaqError = PoolError::SampleLength { requested: 9, max: 8 }.into();
        assert_eq!(
            err.to_string(),
            "Sample pool error: sample length 9 exceeds maximum 8"
        );
    }

    #[test]
    fn test_frame_error_kinds() {
        assert_eq!(
            FrameError::BadChecksum { expected: 1, computed: 2 }.kind(),
            "bad_checksum"
        );
        assert_eq!(FrameError::Oversize { length: 9, max: 8 }.kind(), "oversize");
        assert_eq!(
            FrameError::BadChecksum { expected: 0xe9, computed: 0x12 }.to_string(),
            "checksum mismatch: expected 0xe9, computed 0x12"
        );
    }
}
