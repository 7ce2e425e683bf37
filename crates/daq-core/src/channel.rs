//! Byte channel abstraction.
//!
//! A [`Channel`] is the raw transport under an acquisition stream: a serial
//! port, a TCP or UDP socket, or a scripted mock. The contract is small and
//! non-blocking aware:
//!
//! - `read` returns `Ok(0)` when no data is available (or the peer is quiet).
//!   A would-block error is treated the same way by callers.
//! - `is_new_input` is true when the bytes of the most recent read start a
//!   new input stream (first read after connect or reconnect), so partial
//!   messages from before can be discarded.
//! - `write` may accept fewer bytes than offered, or fail with
//!   `ErrorKind::WouldBlock` when the channel is not ready.

use std::io;

/// Raw byte transport owned by a single acquisition thread.
pub trait Channel: Send {
    /// Name used in log records and errors.
    fn name(&self) -> &str;

    /// Read available bytes into `buf`. `Ok(0)` means nothing available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the most recent read began a new input stream.
    fn is_new_input(&self) -> bool;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()>;

    /// Line rate in bits per second, for channels that have one.
    fn baud_rate(&self) -> Option<u32> {
        None
    }

    /// Bits on the wire per data byte (start + data + parity + stop).
    fn bits_per_byte(&self) -> u32 {
        10
    }

    /// Handle that another thread can use to unblock a pending `read`.
    fn interrupter(&self) -> Option<Box<dyn ChannelInterrupt>> {
        None
    }
}

/// Unblocks a channel's pending read from another thread.
pub trait ChannelInterrupt: Send + Sync {
    /// Make a blocked or future read return promptly.
    fn interrupt(&self) -> io::Result<()>;
}

/// Transmission time of one byte in microseconds.
#[must_use]
pub fn usecs_per_byte(baud_rate: u32, bits_per_byte: u32) -> f64 {
    if baud_rate == 0 {
        return 0.0;
    }
    f64::from(bits_per_byte) * 1.0e6 / f64::from(baud_rate)
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn is_new_input(&self) -> bool {
        (**self).is_new_input()
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn baud_rate(&self) -> Option<u32> {
        (**self).baud_rate()
    }

    fn bits_per_byte(&self) -> u32 {
        (**self).bits_per_byte()
    }

    fn interrupter(&self) -> Option<Box<dyn ChannelInterrupt>> {
        (**self).interrupter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usecs_per_byte() {
        assert!((usecs_per_byte(9600, 10) - 1041.666).abs() < 0.01);
        assert!((usecs_per_byte(115_200, 10) - 86.805).abs() < 0.01);
        assert_eq!(usecs_per_byte(0, 10), 0.0);
    }
}
