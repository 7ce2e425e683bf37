//! Scripted channel for tests and bench runs.
//!
//! A [`MockChannel`] plays back a script of read events. Each data chunk
//! can advance a shared [`ManualClock`] so the read-completion instant seen
//! by the stream is exact. Writes land in a shared [`WriteLog`] and can be
//! throttled step by step.
//!
//! ```
//! use std::time::Duration;
//! use daq_io::channels::mock::MockChannel;
//!
//! let channel = MockChannel::new("tilt")
//!     .chunk(b"\xff\x01\xbb\xff\x2e\xe9", Duration::from_millis(180))
//!     .new_input()
//!     .chunk(b"\xff\x01\xbb\xff\x2e\xe9", Duration::from_millis(180));
//! assert_eq!(channel.remaining(), 3);
//! ```

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use daq_core::channel::Channel;
use daq_core::clock::ManualClock;
use parking_lot::Mutex;

/// One scripted read-side event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Bytes delivered by one read; the clock advances by `advance` first.
    Data {
        /// Payload of the read.
        bytes: Vec<u8>,
        /// Clock advance before the read completes.
        advance: Duration,
    },
    /// The next data chunk starts a new input stream.
    NewInput,
    /// One read fails with `WouldBlock`.
    WouldBlock,
    /// One read fails with this error kind.
    Fail(ErrorKind),
}

/// Outcome of one physical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    /// Accept at most this many bytes.
    Accept(usize),
    /// Fail with `WouldBlock`.
    WouldBlock,
    /// Fail with this error kind.
    Fail(ErrorKind),
}

/// Shared record of everything written to a [`MockChannel`].
#[derive(Debug, Clone, Default)]
pub struct WriteLog(Arc<Mutex<Vec<u8>>>);

impl WriteLog {
    /// Bytes written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Number of bytes written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Scripted channel for tests and bench runs.
#[derive(Debug)]
pub struct MockChannel {
    name: String,
    script: VecDeque<MockEvent>,
    replay: Option<Vec<MockEvent>>,
    pacing: Option<Duration>,
    clock: Option<ManualClock>,
    pending_new_input: bool,
    new_input: bool,
    writes: VecDeque<WriteStep>,
    log: WriteLog,
    baud_rate: Option<u32>,
    bits_per_byte: u32,
    closed: bool,
}

impl MockChannel {
    /// Empty script; the first chunk counts as new input.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: VecDeque::new(),
            replay: None,
            pacing: None,
            clock: None,
            pending_new_input: true,
            new_input: false,
            writes: VecDeque::new(),
            log: WriteLog::default(),
            baud_rate: None,
            bits_per_byte: 10,
            closed: false,
        }
    }

    /// Channel that delivers `data` every `interval`, optionally forever.
    #[must_use]
    pub fn replay(name: impl Into<String>, data: Vec<u8>, interval: Duration, repeat: bool) -> Self {
        let mut channel = Self::new(name).chunk(&data, Duration::ZERO);
        channel.pacing = Some(interval);
        if repeat {
            channel.replay = Some(channel.script.iter().cloned().collect());
        }
        channel
    }

    /// Advance `clock` as chunks are read.
    #[must_use]
    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Report a line speed, enabling latency correction.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32, bits_per_byte: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self.bits_per_byte = bits_per_byte;
        self
    }

    /// Deliver `bytes` in one read, `advance` after the previous one.
    #[must_use]
    pub fn chunk(mut self, bytes: &[u8], advance: Duration) -> Self {
        self.script.push_back(MockEvent::Data {
            bytes: bytes.to_vec(),
            advance,
        });
        self
    }

    /// Mark the next chunk as new input.
    #[must_use]
    pub fn new_input(mut self) -> Self {
        self.script.push_back(MockEvent::NewInput);
        self
    }

    /// One read fails with `WouldBlock`.
    #[must_use]
    pub fn would_block(mut self) -> Self {
        self.script.push_back(MockEvent::WouldBlock);
        self
    }

    /// One read fails with `kind`.
    #[must_use]
    pub fn fail(mut self, kind: ErrorKind) -> Self {
        self.script.push_back(MockEvent::Fail(kind));
        self
    }

    /// Script the outcomes of the next physical writes. Once exhausted,
    /// writes are accepted in full.
    #[must_use]
    pub fn write_steps(mut self, steps: impl IntoIterator<Item = WriteStep>) -> Self {
        self.writes.extend(steps);
        self
    }

    /// Handle on everything written.
    #[must_use]
    pub fn write_log(&self) -> WriteLog {
        self.log.clone()
    }

    /// Read events not yet played.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(ErrorKind::NotConnected.into());
        }
        loop {
            if self.script.is_empty() {
                if let Some(replay) = &self.replay {
                    self.script.extend(replay.iter().cloned());
                }
            }
            let Some(event) = self.script.pop_front() else {
                return Ok(0);
            };
            match event {
                MockEvent::NewInput => self.pending_new_input = true,
                MockEvent::WouldBlock => return Err(ErrorKind::WouldBlock.into()),
                MockEvent::Fail(kind) => return Err(kind.into()),
                MockEvent::Data { bytes, advance } => {
                    if let Some(pace) = self.pacing {
                        thread::sleep(pace);
                    }
                    if let Some(clock) = &self.clock {
                        clock.advance(advance);
                    }
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.script.push_front(MockEvent::Data {
                            bytes: bytes[n..].to_vec(),
                            advance: Duration::ZERO,
                        });
                    }
                    self.new_input = std::mem::take(&mut self.pending_new_input);
                    return Ok(n);
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(ErrorKind::NotConnected.into());
        }
        let n = match self.writes.pop_front() {
            None => buf.len(),
            Some(WriteStep::Accept(limit)) => limit.min(buf.len()),
            Some(WriteStep::WouldBlock) => return Err(ErrorKind::WouldBlock.into()),
            Some(WriteStep::Fail(kind)) => return Err(kind.into()),
        };
        self.log.0.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn is_new_input(&self) -> bool {
        self.new_input
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    fn bits_per_byte(&self) -> u32 {
        self.bits_per_byte
    }
}
