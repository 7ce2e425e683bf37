//! Double-buffered byte stream over a [`Channel`].
//!
//! # Architecture
//!
//! ```text
//!            read side                          write side
//! channel ──read()──► [ tail ... head ]   [ wtail ... whead ] ──flush──► channel
//!                       │                   ▲
//!                       ▼                   │
//!         read_into / read_until / skip    write(&[&[u8]])
//!         buffered() / backup
//! ```
//!
//! Each side is a single heap arena with a `tail` (first unread byte) and
//! `head` (first free byte) offset, `0 <= tail <= head <= capacity`. The
//! window slides; it is moved back to the start of the arena by compaction
//! (`copy_within`) rather than wrap-around arithmetic.
//!
//! The read side performs **at most one physical read per [`IoStream::read`]
//! call**, and only when nothing is buffered, so a reader loop can treat one
//! call as one readiness-triggered unit of work.
//!
//! The write side batches small records. A physical write is issued when
//! buffered bytes reach half the capacity, when the oldest buffered byte
//! has waited longer than the configured maximum latency, or when room is
//! needed for the current call. [`IoStream::write`] is atomic: a record is
//! either fully absorbed or not at all.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use daq_core::channel::Channel;
use daq_core::clock::Clock;
use daq_core::config::IoConfig;
use daq_core::error::is_transient_io;
use daq_core::limits;
use daq_pool::Timetag;
use tracing::{debug, trace};

/// Buffering parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoStreamConfig {
    /// Size of each of the read and write buffers.
    pub capacity: usize,
    /// Longest buffered output may wait before a physical write.
    pub max_latency: Duration,
    /// Physical write attempts made by [`IoStream::flush`].
    pub flush_retries: u32,
    /// Pause between flush attempts while the channel would block.
    pub flush_retry_pause: Duration,
}

impl Default for IoStreamConfig {
    fn default() -> Self {
        Self {
            capacity: limits::iostream_capacity(0),
            max_latency: limits::DEFAULT_MAX_LATENCY,
            flush_retries: limits::DEFAULT_FLUSH_RETRIES,
            flush_retry_pause: limits::FLUSH_RETRY_PAUSE,
        }
    }
}

impl IoStreamConfig {
    /// Size the buffer for messages of about `expected_message` bytes.
    #[must_use]
    pub fn for_message_size(expected_message: usize) -> Self {
        Self {
            capacity: limits::iostream_capacity(expected_message),
            ..Default::default()
        }
    }

    /// Apply a sensor's `[io]` section on top of message-size sizing.
    pub fn from_io_config(io: &IoConfig, expected_message: usize) -> daq_core::AppResult<Self> {
        let capacity = match io.buffer_size {
            Some(size) => limits::validate_capacity(size)?,
            None => limits::iostream_capacity(expected_message),
        };
        Ok(Self {
            capacity,
            max_latency: Duration::from_millis(io.max_latency_ms),
            flush_retries: io.flush_retries,
            ..Default::default()
        })
    }
}

/// Transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Bytes received from the channel.
    pub bytes_in: u64,
    /// Bytes accepted by the channel.
    pub bytes_out: u64,
    /// Channel reads that returned data or EOF.
    pub physical_reads: u64,
    /// Channel writes that did not would-block.
    pub physical_writes: u64,
    /// Reads or writes that would have blocked.
    pub would_block: u64,
    /// Bytes dropped by `read_until` on new input.
    pub discarded: u64,
    /// `write` calls that could not make room and absorbed nothing.
    pub rejected_writes: u64,
    /// Times the buffers were grown.
    pub reallocations: u64,
}

/// Byte buffer between a raw channel and the scanner.
///
/// Owned by exactly one acquisition thread.
#[derive(Debug)]
pub struct IoStream<C: Channel = Box<dyn Channel>> {
    channel: C,
    clock: Arc<dyn Clock>,
    config: IoStreamConfig,

    rbuf: Vec<u8>,
    tail: usize,
    head: usize,
    new_input: bool,
    last_read: Timetag,

    wbuf: Vec<u8>,
    wtail: usize,
    whead: usize,
    last_write: Timetag,
    /// Fatal error from a flush after the caller's data was already queued.
    write_error: Option<io::Error>,

    stats: IoStats,
}

impl<C: Channel> IoStream<C> {
    /// Stream over `channel`, time-stamping reads with `clock`.
    pub fn new(channel: C, clock: Arc<dyn Clock>, config: IoStreamConfig) -> Self {
        let capacity = config.capacity.max(1);
        let now = clock.now_usecs();
        Self {
            channel,
            clock,
            config: IoStreamConfig { capacity, ..config },
            rbuf: vec![0; capacity],
            tail: 0,
            head: 0,
            new_input: false,
            last_read: now,
            wbuf: vec![0; capacity],
            wtail: 0,
            whead: 0,
            last_write: now,
            write_error: None,
            stats: IoStats::default(),
        }
    }

    /// Underlying channel.
    #[must_use]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Underlying channel, mutably.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Current size of each buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Transfer counters.
    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Unread bytes in the read buffer.
    #[must_use]
    pub fn available(&self) -> usize {
        self.head - self.tail
    }

    /// The unread bytes, without consuming them.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.rbuf[self.tail..self.head]
    }

    /// Whether the most recent physical read began a new input stream.
    #[must_use]
    pub fn is_new_input(&self) -> bool {
        self.new_input
    }

    /// Completion time of the most recent physical read that returned data.
    #[must_use]
    pub fn last_read_time(&self) -> Timetag {
        self.last_read
    }

    /// One physical read, only when nothing is buffered.
    ///
    /// Returns 0 without touching the channel when bytes are still
    /// buffered, and 0 when the channel has nothing (or would block).
    pub fn read(&mut self) -> io::Result<usize> {
        if self.available() > 0 {
            return Ok(0);
        }
        self.tail = 0;
        self.head = 0;

        let n = match self.channel.read(&mut self.rbuf) {
            Ok(n) => n,
            Err(e) if is_transient_io(&e) => {
                self.stats.would_block += 1;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(0);
        }

        self.head = n;
        self.new_input = self.channel.is_new_input();
        self.last_read = self.clock.now_usecs();
        self.stats.physical_reads += 1;
        self.stats.bytes_in += n as u64;
        trace!(channel = self.channel.name(), bytes = n, new_input = self.new_input, "read");
        Ok(n)
    }

    /// Copy up to `buf.len()` bytes out, reading from the channel as needed.
    ///
    /// Stops early when a physical read returns nothing.
    pub fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < buf.len() {
            if self.available() == 0 && self.read()? == 0 {
                break;
            }
            let take = self.available().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&self.rbuf[self.tail..self.tail + take]);
            self.tail += take;
            copied += take;
        }
        Ok(copied)
    }

    /// Copy bytes up to and including `terminator`.
    ///
    /// At most `buf.len() - 1` bytes are copied and a NUL is stored after
    /// them. If a physical read begins new input while a partial record is
    /// held, the partial record is discarded and accumulation restarts with
    /// the new bytes. Returns short when the channel runs dry.
    pub fn read_until(&mut self, buf: &mut [u8], terminator: u8) -> io::Result<usize> {
        let Some(limit) = buf.len().checked_sub(1) else {
            return Ok(0);
        };
        let mut copied = 0;
        while copied < limit {
            if self.available() == 0 {
                if self.read()? == 0 {
                    break;
                }
                if self.new_input && copied > 0 {
                    debug!(
                        channel = self.channel.name(),
                        discarded = copied,
                        "New input, dropping partial record"
                    );
                    self.stats.discarded += copied as u64;
                    copied = 0;
                }
            }
            let window = &self.rbuf[self.tail..self.head];
            let room = limit - copied;
            let (take, done) = match window.iter().take(room).position(|&b| b == terminator) {
                Some(pos) => (pos + 1, true),
                None => (window.len().min(room), false),
            };
            buf[copied..copied + take].copy_from_slice(&window[..take]);
            self.tail += take;
            copied += take;
            if done {
                break;
            }
        }
        buf[copied] = 0;
        Ok(copied)
    }

    /// Consume up to `len` buffered bytes without copying.
    pub fn skip(&mut self, len: usize) -> usize {
        let n = len.min(self.available());
        self.tail += n;
        n
    }

    /// Un-consume up to `len` bytes of the current buffer.
    pub fn backup(&mut self, len: usize) -> usize {
        let n = len.min(self.tail);
        self.tail -= n;
        n
    }

    /// Bytes written by callers but not yet accepted by the channel.
    #[must_use]
    pub fn pending_write(&self) -> usize {
        self.whead - self.wtail
    }

    fn write_space(&self) -> usize {
        self.config.capacity - self.pending_write()
    }

    fn flush_due(&self) -> bool {
        let pending = self.pending_write();
        if pending == 0 {
            return false;
        }
        let waited = self.clock.now_usecs() - self.last_write;
        pending >= self.config.capacity / 2
            || waited >= i64::try_from(self.config.max_latency.as_micros()).unwrap_or(i64::MAX)
    }

    /// Buffer `bufs` as one record.
    ///
    /// Returns the combined length when every buffer was absorbed, or 0
    /// when room could not be made. Makes at most two physical write
    /// attempts: one to make room before filling, one afterwards when the
    /// flush policy says so. Would-block on the channel is not an error.
    ///
    /// An `Err` always means nothing of this record was absorbed. A fatal
    /// error from the flush after filling is held back and returned by the
    /// next `write` or [`flush`](Self::flush).
    pub fn write(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        if let Some(e) = self.write_error.take() {
            return Err(e);
        }
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }
        if total > self.config.capacity {
            self.reallocate(total.max(self.config.capacity * 2));
        }

        if self.write_space() < total {
            self.write_pending()?;
            if self.write_space() < total {
                self.stats.rejected_writes += 1;
                return Ok(0);
            }
        }

        if self.config.capacity - self.whead < total {
            self.compact_write();
        }
        for buf in bufs {
            self.wbuf[self.whead..self.whead + buf.len()].copy_from_slice(buf);
            self.whead += buf.len();
        }

        if self.flush_due() {
            if let Err(e) = self.write_pending() {
                debug!(channel = self.channel.name(), error = %e, "Write failed after queuing record");
                self.write_error = Some(e);
            }
        }
        Ok(total)
    }

    /// One physical write of pending bytes. Would-block counts as 0 bytes.
    fn write_pending(&mut self) -> io::Result<usize> {
        if self.pending_write() == 0 {
            return Ok(0);
        }
        let n = match self.channel.write(&self.wbuf[self.wtail..self.whead]) {
            Ok(n) => n,
            Err(e) if is_transient_io(&e) => {
                self.stats.would_block += 1;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        self.stats.physical_writes += 1;
        if n > 0 {
            self.wtail += n;
            if self.wtail == self.whead {
                self.wtail = 0;
                self.whead = 0;
            }
            self.last_write = self.clock.now_usecs();
            self.stats.bytes_out += n as u64;
        }
        Ok(n)
    }

    fn compact_write(&mut self) {
        if self.wtail > 0 {
            self.wbuf.copy_within(self.wtail..self.whead, 0);
            self.whead -= self.wtail;
            self.wtail = 0;
        }
    }

    /// Drain pending writes with a bounded number of attempts.
    ///
    /// Returns the bytes still pending, which is non-zero when the channel
    /// stayed unwritable.
    pub fn flush(&mut self) -> io::Result<usize> {
        if let Some(e) = self.write_error.take() {
            return Err(e);
        }
        for _ in 0..self.config.flush_retries {
            if self.pending_write() == 0 {
                break;
            }
            if self.write_pending()? == 0 {
                thread::sleep(self.config.flush_retry_pause);
            }
        }
        match self.channel.flush() {
            Ok(()) => {}
            Err(e) if is_transient_io(&e) => {}
            Err(e) => return Err(e),
        }
        let pending = self.pending_write();
        if pending > 0 {
            debug!(channel = self.channel.name(), pending, "Flush left bytes pending");
        }
        Ok(pending)
    }

    /// Grow both buffers to at least `capacity`, keeping unread bytes.
    ///
    /// Buffers never shrink; a smaller request is a no-op.
    pub fn reallocate(&mut self, capacity: usize) {
        if capacity <= self.config.capacity {
            return;
        }
        let unread = self.available();
        self.rbuf.copy_within(self.tail..self.head, 0);
        self.tail = 0;
        self.head = unread;
        self.rbuf.resize(capacity, 0);

        self.compact_write();
        self.wbuf.resize(capacity, 0);

        debug!(
            channel = self.channel.name(),
            from = self.config.capacity,
            to = capacity,
            "IoStream buffer grown"
        );
        self.config.capacity = capacity;
        self.stats.reallocations += 1;
    }

    /// Flush what can be flushed, then close the channel.
    pub fn close(&mut self) -> io::Result<()> {
        let flushed = self.flush();
        self.channel.close()?;
        flushed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::mock::{MockChannel, WriteStep};
    use daq_core::clock::ManualClock;
    use std::io::ErrorKind;

    fn stream(channel: MockChannel, clock: &ManualClock, capacity: usize) -> IoStream<MockChannel> {
        IoStream::new(
            channel,
            Arc::new(clock.clone()),
            IoStreamConfig {
                capacity,
                flush_retry_pause: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_read_only_when_empty() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").chunk(b"hello", Duration::from_millis(5)).chunk(b"world", Duration::ZERO);
        let mut io = stream(channel, &clock, 64);

        assert_eq!(io.read().unwrap(), 5);
        assert_eq!(io.last_read_time(), 0);
        // buffered data: no physical read, buffer untouched
        assert_eq!(io.read().unwrap(), 0);
        assert_eq!(io.buffered(), b"hello");
        assert_eq!(io.stats().physical_reads, 1);
    }

    #[test]
    fn test_last_read_time_follows_clock() {
        let clock = ManualClock::new(1_000);
        let channel = MockChannel::new("m")
            .with_clock(clock.clone())
            .chunk(b"ab", Duration::from_millis(180));
        let mut io = stream(channel, &clock, 64);
        io.read().unwrap();
        assert_eq!(io.last_read_time(), 181_000);
    }

    #[test]
    fn test_read_into_spans_reads_and_stops_short() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m")
            .chunk(b"abc", Duration::ZERO)
            .chunk(b"defg", Duration::ZERO);
        let mut io = stream(channel, &clock, 64);

        let mut buf = [0u8; 5];
        assert_eq!(io.read_into(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abcde");

        let mut rest = [0u8; 10];
        assert_eq!(io.read_into(&mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"fg");
    }

    #[test]
    fn test_read_until_terminator_and_limit() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").chunk(b"12;3456789;", Duration::ZERO);
        let mut io = stream(channel, &clock, 64);

        let mut buf = [0xffu8; 8];
        assert_eq!(io.read_until(&mut buf, b';').unwrap(), 3);
        assert_eq!(&buf[..4], b"12;\0");

        // 7 bytes max, then NUL
        assert_eq!(io.read_until(&mut buf, b';').unwrap(), 7);
        assert_eq!(&buf, b"3456789\0");
        assert_eq!(io.read_until(&mut buf, b';').unwrap(), 1);
    }

    #[test]
    fn test_read_until_discards_partial_on_new_input() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m")
            .chunk(b"AB", Duration::ZERO)
            .new_input()
            .chunk(b"CD;", Duration::ZERO);
        let mut io = stream(channel, &clock, 64);

        let mut buf = [0u8; 16];
        let n = io.read_until(&mut buf, b';').unwrap();
        assert_eq!(&buf[..n], b"CD;");
        assert_eq!(io.stats().discarded, 2);
    }

    #[test]
    fn test_skip_and_backup() {
        let clock = ManualClock::new(0);
        let mut io = stream(MockChannel::new("m").chunk(b"abcdef", Duration::ZERO), &clock, 64);
        io.read().unwrap();
        assert_eq!(io.skip(4), 4);
        assert_eq!(io.buffered(), b"ef");
        assert_eq!(io.backup(2), 2);
        assert_eq!(io.buffered(), b"cdef");
        assert_eq!(io.backup(10), 2);
        assert_eq!(io.skip(100), 6);
        assert_eq!(io.available(), 0);
    }

    #[test]
    fn test_would_block_read_is_no_data() {
        let clock = ManualClock::new(0);
        let mut io = stream(MockChannel::new("m").would_block(), &clock, 64);
        assert_eq!(io.read().unwrap(), 0);
        assert_eq!(io.stats().would_block, 1);
    }

    #[test]
    fn test_small_writes_are_batched_until_half_full() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m");
        let log = channel.write_log();
        let mut io = stream(channel, &clock, 64);

        for _ in 0..7 {
            assert_eq!(io.write(&[b"abcd"]).unwrap(), 4);
        }
        assert!(log.is_empty());
        assert_eq!(io.write(&[b"efgh"]).unwrap(), 4);
        assert_eq!(log.len(), 32);
        assert_eq!(io.pending_write(), 0);
    }

    #[test]
    fn test_latency_bound_triggers_write() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m");
        let log = channel.write_log();
        let mut io = stream(channel, &clock, 64);

        io.write(&[b"x"]).unwrap();
        assert!(log.is_empty());
        clock.advance(Duration::from_millis(250));
        io.write(&[b"y"]).unwrap();
        assert_eq!(log.contents(), b"xy");
    }

    #[test]
    fn test_write_is_all_or_nothing() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").write_steps([WriteStep::WouldBlock, WriteStep::WouldBlock]);
        let mut io = stream(channel, &clock, 16);

        assert_eq!(io.write(&[b"0123456", b"7"]).unwrap(), 8);
        // would-block on the post-fill flush attempt
        assert_eq!(io.pending_write(), 8);
        // 8 + 9 > 16 and the channel would block: nothing absorbed
        assert_eq!(io.write(&[b"abcd", b"efghi"]).unwrap(), 0);
        assert_eq!(io.pending_write(), 8);
        assert_eq!(io.stats().rejected_writes, 1);
    }

    #[test]
    fn test_partial_channel_write_then_compaction() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").write_steps([WriteStep::Accept(6), WriteStep::Accept(100)]);
        let log = channel.write_log();
        let mut io = stream(channel, &clock, 16);

        assert_eq!(io.write(&[b"01234567"]).unwrap(), 8);
        assert_eq!(io.pending_write(), 2);
        assert_eq!(io.write(&[b"abcdefghijklmn"]).unwrap(), 14);
        assert_eq!(log.contents(), b"01234567abcdefghijklmn");
    }

    #[test]
    fn test_oversized_record_grows_buffer() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m");
        let log = channel.write_log();
        let mut io = stream(channel, &clock, 8);

        let record = [7u8; 20];
        assert_eq!(io.write(&[&record]).unwrap(), 20);
        assert!(io.capacity() >= 20);
        assert_eq!(io.stats().reallocations, 1);
        assert_eq!(log.len(), 20);
    }

    #[test]
    fn test_flush_is_bounded() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").write_steps(std::iter::repeat(WriteStep::WouldBlock).take(50));
        let mut io = stream(channel, &clock, 64);
        io.write(&[b"abc"]).unwrap();
        assert_eq!(io.flush().unwrap(), 3);
    }

    #[test]
    fn test_flush_drains() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").write_steps([WriteStep::Accept(1), WriteStep::WouldBlock]);
        let log = channel.write_log();
        let mut io = stream(channel, &clock, 64);
        io.write(&[b"abc"]).unwrap();
        assert_eq!(io.flush().unwrap(), 0);
        assert_eq!(log.contents(), b"abc");
    }

    #[test]
    fn test_reallocate_keeps_unread_bytes() {
        let clock = ManualClock::new(0);
        let mut io = stream(MockChannel::new("m").chunk(b"abcdef", Duration::ZERO), &clock, 64);
        io.read().unwrap();
        io.skip(2);
        io.reallocate(32);
        assert_eq!(io.capacity(), 64);
        io.reallocate(256);
        assert_eq!(io.capacity(), 256);
        assert_eq!(io.buffered(), b"cdef");
    }

    #[test]
    fn test_fatal_write_error_propagates() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").write_steps([WriteStep::Fail(ErrorKind::BrokenPipe)]);
        let mut io = stream(channel, &clock, 16);
        assert_eq!(io.write(&[b"abcd"]).unwrap(), 4);
        // the record is queued before the flush fails, so it counts as written
        assert_eq!(io.write(&[b"efghijkl"]).unwrap(), 8);
        assert_eq!(io.pending_write(), 12);

        let err = io.write(&[b"m"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert_eq!(io.pending_write(), 12);
    }

    #[test]
    fn test_deferred_write_error_reported_by_flush() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m").write_steps([WriteStep::Fail(ErrorKind::BrokenPipe)]);
        let log = channel.write_log();
        let mut io = stream(channel, &clock, 16);
        assert_eq!(io.write(&[b"abcdefgh"]).unwrap(), 8);
        assert_eq!(io.flush().unwrap_err().kind(), ErrorKind::BrokenPipe);

        // reported once; the queued record is still delivered exactly once
        assert_eq!(io.flush().unwrap(), 0);
        assert_eq!(log.contents(), b"abcdefgh");
    }
}
