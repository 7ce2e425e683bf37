//! Shared hard limits for byte-stream buffering and acquisition threads.
//!
//! This module centralizes:
//! - IOStream buffer sizing bounds
//! - Flush and shutdown timing defaults
//!
//! Per-sensor configuration may tune the defaults; the bounds are not
//! configurable.

use std::time::Duration;

use crate::error::DaqError;

// =============================================================================
// Timing
// =============================================================================

/// Longest buffered written data waits before a physical write (250 ms).
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(250);

/// Attempts made by a synchronous IOStream flush before giving up.
pub const DEFAULT_FLUSH_RETRIES: u32 = 10;

/// Pause between flush attempts while the channel would block.
pub const FLUSH_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// How long `AcquisitionThread::stop` waits for a reader to exit before
/// reporting it as hung.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Size Limits
// =============================================================================

/// Smallest IOStream buffer.
pub const MIN_IOSTREAM_CAPACITY: usize = 64;

/// Largest IOStream buffer (16 MiB).
pub const MAX_IOSTREAM_CAPACITY: usize = 16 * 1024 * 1024;

/// IOStream capacity for a given expected message size: twice the message,
/// clamped to the bounds above.
#[must_use]
pub fn iostream_capacity(expected_message: usize) -> usize {
    expected_message
        .saturating_mul(2)
        .clamp(MIN_IOSTREAM_CAPACITY, MAX_IOSTREAM_CAPACITY)
}

/// Check a requested buffer capacity against [`MAX_IOSTREAM_CAPACITY`].
pub fn validate_capacity(requested: usize) -> Result<usize, DaqError> {
    if requested > MAX_IOSTREAM_CAPACITY {
        return Err(DaqError::Configuration(format!(
            "buffer capacity {requested} exceeds {MAX_IOSTREAM_CAPACITY}"
        )));
    }
    Ok(requested.max(MIN_IOSTREAM_CAPACITY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iostream_capacity() {
        assert_eq!(iostream_capacity(6), MIN_IOSTREAM_CAPACITY);
        assert_eq!(iostream_capacity(1000), 2000);
        assert_eq!(iostream_capacity(usize::MAX), MAX_IOSTREAM_CAPACITY);
    }

    #[test]
    fn test_validate_capacity() {
        assert_eq!(validate_capacity(10).unwrap(), MIN_IOSTREAM_CAPACITY);
        assert_eq!(validate_capacity(4096).unwrap(), 4096);
        assert!(validate_capacity(MAX_IOSTREAM_CAPACITY + 1).is_err());
    }
}
