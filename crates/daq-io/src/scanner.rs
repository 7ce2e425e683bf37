//! Message framing over an [`IoStream`].
//!
//! The [`Scanner`] turns the bytes of each physical read into framed
//! [`RawMessage`]s. Three framings are supported:
//!
//! - **Fixed**: records of a known length.
//! - **Separator**: a separator either begins each message (prefix) or
//!   ends it (suffix). With a prefix separator and a message length, the
//!   length counts from the separator, so payload bytes equal to the
//!   separator are harmless. With a suffix separator the length is a
//!   minimum before the separator is looked for.
//! - **Counted**: a length field in a fixed header gives the total size.
//!
//! The scanner drains the stream completely on every call sequence,
//! holding any partial message itself, so the next [`IoStream::read`] can
//! always go to the channel.
//!
//! # Time tags
//!
//! A message is stamped when its first byte is seen, with the completion
//! time of the read that delivered that byte. With latency correction the
//! stamp is moved back by the transmission time of the bytes from the
//! message start to the end of that read:
//!
//! ```text
//! tag = read_completion - bytes_remaining_in_read * usecs_per_byte
//! ```

use bytes::BytesMut;
use daq_core::channel::Channel;
use daq_core::config::{parse_separator, FramingConfig, LengthFieldConfig};
use daq_core::decoder::RawMessage;
use daq_core::error::{AppResult, DaqError, FrameError};
use daq_pool::Timetag;

use crate::iostream::IoStream;

/// Length prefix of counted framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthField {
    /// Byte offset of the field from the message start.
    pub offset: usize,
    /// 1, 2 or 4 bytes.
    pub width: usize,
    /// Most significant byte first.
    pub big_endian: bool,
    /// Added to the field value to give the total message length.
    pub adjust: i64,
}

impl LengthField {
    fn header_len(&self) -> usize {
        self.offset + self.width
    }

    fn value(&self, header: &[u8]) -> u64 {
        let field = &header[self.offset..self.offset + self.width];
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        if self.big_endian {
            field.iter().fold(0, fold)
        } else {
            field.iter().rev().fold(0, fold)
        }
    }
}

impl From<&LengthFieldConfig> for LengthField {
    fn from(config: &LengthFieldConfig) -> Self {
        Self {
            offset: config.offset,
            width: usize::from(config.width),
            big_endian: config.big_endian,
            adjust: config.adjust,
        }
    }
}

/// How message boundaries are found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Records of exactly `length` bytes.
    Fixed {
        /// Record length in bytes.
        length: usize,
    },
    /// Records delimited by a separator.
    Separator {
        /// Delimiter bytes, kept as part of the message.
        separator: Vec<u8>,
        /// Separator ends the message instead of starting it.
        at_end: bool,
        /// Fixed length (prefix) or minimum length (suffix); 0 = none.
        length: usize,
    },
    /// Records whose total length is read from a header field.
    Counted(LengthField),
}

impl Framing {
    /// Framing described by a sensor's `[framing]` section.
    pub fn from_config(config: &FramingConfig) -> AppResult<Self> {
        if let Some(field) = &config.length_field {
            return Ok(Framing::Counted(field.into()));
        }
        if let Some(text) = &config.separator {
            let separator = parse_separator(text).map_err(DaqError::Configuration)?;
            return Ok(Framing::Separator {
                separator,
                at_end: config.separator_at_end,
                length: config.message_length,
            });
        }
        if config.message_length > 0 {
            return Ok(Framing::Fixed {
                length: config.message_length,
            });
        }
        Err(DaqError::Configuration(
            "framing needs message_length, separator or length_field".into(),
        ))
    }

    /// Typical message size, for sizing buffers.
    #[must_use]
    pub fn expected_message_size(&self, max_length: usize) -> usize {
        match self {
            Framing::Fixed { length } => *length,
            Framing::Separator { length, .. } if *length > 0 => *length,
            Framing::Separator { .. } | Framing::Counted(_) => max_length.min(1024),
        }
    }
}

/// Framing state machine for one byte stream.
#[derive(Debug)]
pub struct Scanner {
    framing: Framing,
    max_length: usize,
    usecs_per_byte: f64,
    partial: BytesMut,
    /// Prefix framing: the separator has been seen and `partial` holds a
    /// message body.
    in_message: bool,
    /// KMP failure table of the separator.
    sep_failure: Vec<usize>,
    sep_matched: usize,
    /// Stamps of the bytes currently matching the separator.
    sep_stamps: Vec<Timetag>,
    sep_start: Timetag,
    message_start: Timetag,
    expected: Option<usize>,
}

impl Scanner {
    /// Scanner for `framing`; messages longer than `max_length` are dropped.
    pub fn new(framing: Framing, max_length: usize) -> AppResult<Self> {
        if max_length == 0 {
            return Err(DaqError::Configuration("maximum message length must be positive".into()));
        }
        match &framing {
            Framing::Fixed { length } if *length == 0 || *length > max_length => {
                return Err(DaqError::Configuration(format!(
                    "message length {length} outside 1..={max_length}"
                )));
            }
            Framing::Separator { separator, .. } if separator.is_empty() => {
                return Err(DaqError::Configuration("separator is empty".into()));
            }
            Framing::Separator { separator, at_end: false, length }
                if *length > max_length || (*length > 0 && *length < separator.len()) =>
            {
                return Err(DaqError::Configuration(format!(
                    "message length {length} incompatible with separator and maximum {max_length}"
                )));
            }
            Framing::Separator { at_end: true, length, .. } if *length >= max_length => {
                return Err(DaqError::Configuration(format!(
                    "minimum message length {length} leaves no room for a separator within {max_length}"
                )));
            }
            Framing::Counted(field) if !matches!(field.width, 1 | 2 | 4) => {
                return Err(DaqError::Configuration(format!(
                    "length field width {} not 1, 2 or 4",
                    field.width
                )));
            }
            Framing::Counted(field) if field.header_len() > max_length => {
                return Err(DaqError::Configuration(
                    "length field lies beyond the maximum message length".into(),
                ));
            }
            _ => {}
        }
        let sep_failure = match &framing {
            Framing::Separator { separator, .. } => failure_table(separator),
            _ => Vec::new(),
        };
        Ok(Self {
            framing,
            max_length,
            usecs_per_byte: 0.0,
            partial: BytesMut::with_capacity(max_length.min(4096)),
            in_message: false,
            sep_failure,
            sep_matched: 0,
            sep_stamps: Vec::new(),
            sep_start: 0,
            message_start: 0,
            expected: None,
        })
    }

    /// Back-date tags by `usecs_per_byte` per outstanding byte; 0 disables.
    #[must_use]
    pub fn with_latency_correction(mut self, usecs_per_byte: f64) -> Self {
        self.usecs_per_byte = usecs_per_byte.max(0.0);
        self
    }

    /// Configured framing.
    #[must_use]
    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Longest message accepted.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Bytes of the message in progress.
    #[must_use]
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    /// Drop any message in progress, e.g. when the channel reports new
    /// input. Returns the discarded message as an outcome, if there was one.
    pub fn resync(&mut self) -> Option<FrameError> {
        let length = self.partial.len();
        self.reset();
        (length > 0).then_some(FrameError::Incomplete { length })
    }

    fn reset(&mut self) {
        self.partial.clear();
        self.in_message = false;
        self.sep_matched = 0;
        self.sep_stamps.clear();
        self.expected = None;
    }

    fn stamp<C: Channel>(&self, io: &IoStream<C>) -> Timetag {
        let outstanding = io.available() as f64 * self.usecs_per_byte;
        io.last_read_time() - outstanding.round() as i64
    }

    fn emit(&mut self, timetag: Timetag) -> RawMessage {
        RawMessage {
            timetag,
            data: self.partial.split().freeze(),
        }
    }

    fn oversize(&mut self) -> FrameError {
        let length = self.partial.len();
        self.reset();
        FrameError::Oversize {
            length,
            max: self.max_length,
        }
    }

    /// Next complete message (or framing failure) from the buffered bytes.
    ///
    /// `None` once the stream's buffer is drained without completing one.
    pub fn next_message<C: Channel>(
        &mut self,
        io: &mut IoStream<C>,
    ) -> Option<Result<RawMessage, FrameError>> {
        match &self.framing {
            Framing::Fixed { length } => {
                let length = *length;
                self.scan_fixed(io, length)
            }
            Framing::Separator {
                at_end: false,
                length,
                ..
            } => {
                let length = *length;
                self.scan_prefix(io, length)
            }
            Framing::Separator { length, .. } => {
                let length = *length;
                self.scan_suffix(io, length)
            }
            Framing::Counted(_) => self.scan_counted(io),
        }
    }

    /// Move up to `limit` bytes into the partial message.
    fn take<C: Channel>(&mut self, io: &mut IoStream<C>, limit: usize) -> usize {
        let n = limit.min(io.available());
        self.partial.extend_from_slice(&io.buffered()[..n]);
        io.skip(n)
    }

    fn separator(&self) -> &[u8] {
        match &self.framing {
            Framing::Separator { separator, .. } => separator,
            _ => &[],
        }
    }

    /// Advance separator matching by one byte. On a complete match
    /// `sep_start` holds the stamp of the separator's first byte.
    fn match_separator(&mut self, byte: u8, stamp: Timetag) -> bool {
        let Framing::Separator { separator, .. } = &self.framing else {
            return false;
        };
        let mut k = self.sep_matched;
        while k > 0 && separator[k] != byte {
            k = self.sep_failure[k - 1];
        }
        if separator[k] == byte {
            k += 1;
        }

        // The surviving match is the last k - 1 matched bytes plus this one.
        let keep = k.saturating_sub(1);
        let stale = self.sep_stamps.len() - keep;
        self.sep_stamps.drain(..stale);
        if k > 0 {
            self.sep_stamps.push(stamp);
        }

        if k == separator.len() {
            self.sep_start = self.sep_stamps[0];
            self.sep_stamps.clear();
            self.sep_matched = 0;
            return true;
        }
        self.sep_matched = k;
        false
    }

    fn scan_fixed<C: Channel>(
        &mut self,
        io: &mut IoStream<C>,
        length: usize,
    ) -> Option<Result<RawMessage, FrameError>> {
        while io.available() > 0 {
            if self.partial.is_empty() {
                self.message_start = self.stamp(io);
            }
            self.take(io, length - self.partial.len());
            if self.partial.len() == length {
                return Some(Ok(self.emit(self.message_start)));
            }
        }
        None
    }

    fn scan_prefix<C: Channel>(
        &mut self,
        io: &mut IoStream<C>,
        length: usize,
    ) -> Option<Result<RawMessage, FrameError>> {
        while io.available() > 0 {
            if !self.in_message {
                let stamp = self.stamp(io);
                let byte = io.buffered()[0];
                io.skip(1);
                if self.match_separator(byte, stamp) {
                    let separator = self.separator().to_vec();
                    self.partial.clear();
                    self.partial.extend_from_slice(&separator);
                    self.message_start = self.sep_start;
                    self.in_message = true;
                }
                continue;
            }

            if length > 0 {
                self.take(io, length - self.partial.len());
                if self.partial.len() == length {
                    self.in_message = false;
                    return Some(Ok(self.emit(self.message_start)));
                }
                continue;
            }

            // Variable length: the message ends where the next one starts.
            let stamp = self.stamp(io);
            let byte = io.buffered()[0];
            io.skip(1);
            self.partial.extend_from_slice(&[byte]);
            if self.match_separator(byte, stamp) {
                let sep_len = self.separator().len();
                let body = self.partial.len() - sep_len;
                let next = self.partial.split_off(body);
                let message = self.emit(self.message_start);
                self.partial = next;
                self.message_start = self.sep_start;
                return Some(Ok(message));
            }
            if self.partial.len() > self.max_length {
                return Some(Err(self.oversize()));
            }
        }
        None
    }

    fn scan_suffix<C: Channel>(
        &mut self,
        io: &mut IoStream<C>,
        min_length: usize,
    ) -> Option<Result<RawMessage, FrameError>> {
        while io.available() > 0 {
            let stamp = self.stamp(io);
            if self.partial.is_empty() {
                self.message_start = stamp;
            }
            if self.partial.len() < min_length {
                self.take(io, min_length - self.partial.len());
                continue;
            }
            let byte = io.buffered()[0];
            io.skip(1);
            self.partial.extend_from_slice(&[byte]);
            if self.match_separator(byte, stamp) {
                return Some(Ok(self.emit(self.message_start)));
            }
            if self.partial.len() >= self.max_length {
                return Some(Err(self.oversize()));
            }
        }
        None
    }

    fn scan_counted<C: Channel>(
        &mut self,
        io: &mut IoStream<C>,
    ) -> Option<Result<RawMessage, FrameError>> {
        let Framing::Counted(field) = &self.framing else {
            return None;
        };
        let field = field.clone();
        let header_len = field.header_len();

        loop {
            if self.partial.len() >= header_len {
                let expected = match self.expected {
                    Some(expected) => expected,
                    None => match self.counted_length(&field) {
                        Ok(total) => {
                            self.expected = Some(total);
                            total
                        }
                        Err(e) => {
                            self.reset();
                            return Some(Err(e));
                        }
                    },
                };
                if self.partial.len() == expected {
                    self.expected = None;
                    return Some(Ok(self.emit(self.message_start)));
                }
                if io.available() == 0 {
                    return None;
                }
                self.take(io, expected - self.partial.len());
                continue;
            }
            if io.available() == 0 {
                return None;
            }
            if self.partial.is_empty() {
                self.message_start = self.stamp(io);
            }
            self.take(io, header_len - self.partial.len());
        }
    }

    /// Total message length announced by a complete header.
    fn counted_length(&self, field: &LengthField) -> Result<usize, FrameError> {
        let value = field.value(&self.partial);
        let total = i64::try_from(value)
            .unwrap_or(i64::MAX)
            .saturating_add(field.adjust);
        if total > self.max_length as i64 {
            return Err(FrameError::Oversize {
                length: usize::try_from(total).unwrap_or(usize::MAX),
                max: self.max_length,
            });
        }
        if total < field.header_len() as i64 {
            return Err(FrameError::Malformed(format!(
                "length field {value} shorter than its {}-byte header",
                field.header_len()
            )));
        }
        Ok(total as usize)
    }
}

/// Longest proper prefix of `pattern[..=i]` that is also its suffix, per `i`.
fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}
