//! One sensor's acquisition pipeline: channel → scanner → decoder → fan-out.
//!
//! A [`SensorReader`] owns everything its acquisition thread touches. One
//! call to [`SensorReader::process_read`] is one unit of work: at most one
//! physical read, then every complete message in it is decoded, time-tag
//! screened and distributed before the call returns.
//!
//! Framing and decoding failures are outcomes, not errors: they are
//! counted in [`ReaderStats`], logged at `warn` with rate limiting, and the
//! reader moves on. Only channel failures end the reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daq_core::channel::{usecs_per_byte, Channel, ChannelInterrupt};
use daq_core::clock::Clock;
use daq_core::config::SensorConfig;
use daq_core::decoder::{Decoder, DecoderContext, DecoderRegistry, RawMessage};
use daq_core::error::{AppResult, FrameError};
use daq_core::fanout::SampleSource;
use daq_core::observability::{LogThrottle, DEFAULT_LOG_EVERY};
use daq_core::timetag::TimetagAdjuster;
use daq_pool::{SampleId, SampleMut, SamplePool};
use tracing::{debug, info, warn};

use crate::channels;
use crate::iostream::{IoStats, IoStream, IoStreamConfig};
use crate::scanner::{Framing, Scanner};

/// Result of one [`SensorReader::process_read`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes delivered by the physical read (0: nothing available).
    pub bytes: usize,
    /// Samples distributed.
    pub samples: usize,
}

/// Live counters, shared with whoever wants to watch the reader.
#[derive(Debug, Default)]
pub struct ReaderStats {
    bytes: AtomicU64,
    messages: AtomicU64,
    samples: AtomicU64,
    bad_checksum: AtomicU64,
    oversize: AtomicU64,
    incomplete: AtomicU64,
    malformed: AtomicU64,
    pool_failures: AtomicU64,
}

/// Point-in-time copy of [`ReaderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStatsSnapshot {
    /// Bytes read from the channel.
    pub bytes: u64,
    /// Framed messages handed to the decoder.
    pub messages: u64,
    /// Samples distributed.
    pub samples: u64,
    /// Messages dropped for a checksum mismatch.
    pub bad_checksum: u64,
    /// Messages dropped for exceeding the maximum length.
    pub oversize: u64,
    /// Partial messages discarded on new input.
    pub incomplete: u64,
    /// Messages the decoder could not interpret.
    pub malformed: u64,
    /// Messages dropped because the pool refused a sample.
    pub pool_failures: u64,
}

impl ReaderStatsSnapshot {
    /// Messages dropped for any reason.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.bad_checksum + self.oversize + self.incomplete + self.malformed + self.pool_failures
    }
}

impl ReaderStats {
    /// Copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> ReaderStatsSnapshot {
        ReaderStatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            bad_checksum: self.bad_checksum.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            incomplete: self.incomplete.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            pool_failures: self.pool_failures.load(Ordering::Relaxed),
        }
    }

    fn drop_counter(&self, error: &FrameError) -> &AtomicU64 {
        match error {
            FrameError::BadChecksum { .. } => &self.bad_checksum,
            FrameError::Oversize { .. } => &self.oversize,
            FrameError::Incomplete { .. } => &self.incomplete,
            FrameError::Malformed(_) => &self.malformed,
            FrameError::Pool(_) => &self.pool_failures,
        }
    }
}

/// Reads, frames, decodes and distributes the samples of one sensor.
pub struct SensorReader<C: Channel = Box<dyn Channel>> {
    name: String,
    id: SampleId,
    io: IoStream<C>,
    scanner: Scanner,
    decoder: Box<dyn Decoder>,
    adjuster: Option<TimetagAdjuster>,
    pool: Arc<SamplePool>,
    source: Arc<SampleSource>,
    stats: Arc<ReaderStats>,
    throttles: HashMap<&'static str, LogThrottle>,
    log_every: u64,
    idle_sleep: Duration,
    decoded: Vec<SampleMut>,
}

impl<C: Channel> std::fmt::Debug for SensorReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorReader")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("framing", self.scanner.framing())
            .field("adjusted", &self.adjuster.is_some())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl SensorReader<Box<dyn Channel>> {
    /// Build a reader from its configuration, opening the channel.
    pub fn from_config(
        sensor: &SensorConfig,
        registry: &DecoderRegistry,
        pool: Arc<SamplePool>,
        source: Arc<SampleSource>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let id = sensor.sample_id();
        let ctx = DecoderContext::new(&sensor.name, id).with_options(sensor.options.clone());
        let decoder = registry.create(&sensor.class, &ctx)?;

        let framing = Framing::from_config(&sensor.framing)?;
        let mut scanner = Scanner::new(framing, sensor.max_message_length)?;
        let io_config = IoStreamConfig::from_io_config(
            &sensor.io,
            scanner.framing().expected_message_size(sensor.max_message_length),
        )?;

        let channel = channels::open(&sensor.name, &sensor.channel)?;
        if sensor.latency_correction {
            match channel.baud_rate() {
                Some(baud) => {
                    scanner = scanner
                        .with_latency_correction(usecs_per_byte(baud, channel.bits_per_byte()));
                }
                None => warn!(
                    sensor = %sensor.name,
                    "Latency correction requested but channel has no baud rate"
                ),
            }
        }

        let adjuster = sensor
            .nominal_rate
            .map(|rate| TimetagAdjuster::new(rate, sensor.adjust_period_secs))
            .transpose()?
            .map(|adjuster| adjuster.for_sample(id));

        info!(
            sensor = %sensor.name,
            class = %sensor.class,
            %id,
            buffer = io_config.capacity,
            "Reader configured"
        );

        let io = IoStream::new(channel, clock, io_config);
        let mut reader = SensorReader::new(&sensor.name, id, io, scanner, decoder, pool, source)
            .with_idle_sleep(Duration::from_millis(sensor.io.idle_sleep_ms));
        reader.adjuster = adjuster;
        Ok(reader)
    }
}

impl<C: Channel> SensorReader<C> {
    /// Reader over prepared parts; see [`from_config`](SensorReader::from_config).
    pub fn new(
        name: impl Into<String>,
        id: SampleId,
        io: IoStream<C>,
        scanner: Scanner,
        decoder: Box<dyn Decoder>,
        pool: Arc<SamplePool>,
        source: Arc<SampleSource>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            io,
            scanner,
            decoder,
            adjuster: None,
            pool,
            source,
            stats: Arc::new(ReaderStats::default()),
            throttles: HashMap::new(),
            log_every: DEFAULT_LOG_EVERY,
            idle_sleep: Duration::from_millis(5),
            decoded: Vec::new(),
        }
    }

    /// Replace decoded time tags with a drift-compensated fixed-rate series.
    #[must_use]
    pub fn with_adjuster(mut self, adjuster: TimetagAdjuster) -> Self {
        self.adjuster = Some(adjuster.for_sample(self.id));
        self
    }

    /// Log every `n`th dropped message of a kind (after the first).
    #[must_use]
    pub fn with_log_every(mut self, n: u64) -> Self {
        self.log_every = n.max(1);
        self.throttles.clear();
        self
    }

    /// Pause taken by the acquisition thread after an empty read.
    #[must_use]
    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    /// Sensor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id stamped on this reader's samples.
    #[must_use]
    pub fn id(&self) -> SampleId {
        self.id
    }

    /// Pause after a read that returned nothing.
    #[must_use]
    pub fn idle_sleep(&self) -> Duration {
        self.idle_sleep
    }

    /// Shared counters; stays valid after the reader moves to its thread.
    #[must_use]
    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    /// Byte stream counters.
    #[must_use]
    pub fn io_stats(&self) -> IoStats {
        self.io.stats()
    }

    /// Fan-out the reader distributes to.
    #[must_use]
    pub fn source(&self) -> &Arc<SampleSource> {
        &self.source
    }

    /// Time-tag adjuster, when a nominal rate is configured.
    #[must_use]
    pub fn adjuster(&self) -> Option<&TimetagAdjuster> {
        self.adjuster.as_ref()
    }

    /// Byte stream, e.g. for writing commands to the sensor.
    pub fn io_mut(&mut self) -> &mut IoStream<C> {
        &mut self.io
    }

    /// Handle that unblocks a pending read from another thread.
    #[must_use]
    pub fn interrupter(&self) -> Option<Box<dyn ChannelInterrupt>> {
        self.io.channel().interrupter()
    }

    /// One physical read and everything it completes.
    ///
    /// Errors are channel failures that end the reader; `Ok` with zero
    /// bytes means nothing was available.
    pub fn process_read(&mut self) -> AppResult<ReadOutcome> {
        let bytes = self.io.read()?;
        if bytes == 0 {
            return Ok(ReadOutcome::default());
        }
        self.stats.bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        if self.io.is_new_input() {
            if let Some(discarded) = self.scanner.resync() {
                self.record_drop(&discarded);
            }
            if let Some(adjuster) = &mut self.adjuster {
                adjuster.reset();
            }
        }

        let mut samples = 0;
        while let Some(framed) = self.scanner.next_message(&mut self.io) {
            match framed {
                Ok(message) => samples += self.handle_message(&message),
                Err(e) => self.record_drop(&e),
            }
        }
        Ok(ReadOutcome { bytes, samples })
    }

    fn handle_message(&mut self, message: &RawMessage) -> usize {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        self.decoded.clear();
        if let Err(e) = self.decoder.decode(message, &self.pool, &mut self.decoded) {
            self.decoded.clear();
            self.record_drop(&e);
            return 0;
        }

        // One screened tag per message; extra samples keep their offset.
        let shift = match &mut self.adjuster {
            Some(adjuster) => adjuster.screen(message.timetag) - message.timetag,
            None => 0,
        };

        let count = self.decoded.len();
        for mut sample in self.decoded.drain(..) {
            if shift != 0 {
                sample.set_timetag(sample.timetag() + shift);
            }
            self.source.distribute(sample.freeze());
        }
        self.stats.samples.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn record_drop(&mut self, error: &FrameError) {
        self.stats.drop_counter(error).fetch_add(1, Ordering::Relaxed);
        let log_every = self.log_every;
        let throttle = self
            .throttles
            .entry(error.kind())
            .or_insert_with(|| LogThrottle::new(log_every));
        if throttle.hit() {
            warn!(
                sensor = %self.name,
                kind = error.kind(),
                count = throttle.count(),
                error = %error,
                "Dropped message"
            );
        } else {
            debug!(sensor = %self.name, kind = error.kind(), "Dropped message");
        }
    }

    /// Flush pending output and close the channel.
    pub fn close(&mut self) -> AppResult<()> {
        self.io.close()?;
        debug!(sensor = %self.name, "Reader closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::mock::MockChannel;
    use daq_core::clock::ManualClock;
    use daq_core::fanout::{ClientFilter, SampleCollector, SampleClient};
    use daq_pool::SampleType;
    use tracing_test::traced_test;

    /// Emits one u8 sample per message; "!" is malformed.
    struct Bytes8 {
        id: SampleId,
    }

    impl Decoder for Bytes8 {
        fn decode(
            &mut self,
            message: &RawMessage,
            pool: &SamplePool,
            out: &mut Vec<SampleMut>,
        ) -> Result<(), FrameError> {
            if message.data.starts_with(b"!") {
                return Err(FrameError::Malformed("bang".into()));
            }
            let mut s = pool.acquire(SampleType::UChar, message.data.len())?;
            s.copy_from(&message.data[..])?;
            s.set_id(self.id);
            s.set_timetag(message.timetag);
            out.push(s);
            Ok(())
        }
    }

    const MS: Duration = Duration::from_millis(1);

    fn reader(channel: MockChannel, clock: &ManualClock) -> (SensorReader<MockChannel>, Arc<SampleCollector>) {
        let id = SampleId::new(1, 20);
        let io = IoStream::new(
            channel.with_clock(clock.clone()),
            Arc::new(clock.clone()),
            IoStreamConfig::for_message_size(16),
        );
        let framing = Framing::Separator {
            separator: b"\n".to_vec(),
            at_end: true,
            length: 0,
        };
        let source = Arc::new(SampleSource::new("test"));
        let collector = Arc::new(SampleCollector::new());
        source.add_client(ClientFilter::All, Arc::clone(&collector) as Arc<dyn SampleClient>);
        let reader = SensorReader::new(
            "test",
            id,
            io,
            Scanner::new(framing, 16).unwrap(),
            Box::new(Bytes8 { id }),
            Arc::new(SamplePool::default()),
            source,
        );
        (reader, collector)
    }

    #[test]
    fn test_process_read_distributes_all_complete_messages() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m")
            .chunk(b"a\nbb\nc", 10 * MS)
            .chunk(b"c\n", 10 * MS);
        let (mut reader, collector) = reader(channel, &clock);

        let first = reader.process_read().unwrap();
        assert_eq!(first, ReadOutcome { bytes: 6, samples: 2 });
        let second = reader.process_read().unwrap();
        assert_eq!(second, ReadOutcome { bytes: 2, samples: 1 });
        assert_eq!(reader.process_read().unwrap(), ReadOutcome::default());

        let samples = collector.take();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].data::<u8>(), Some(&b"cc\n"[..]));
        assert_eq!(samples[2].timetag(), 10_000);
        assert_eq!(samples[0].id(), SampleId::new(1, 20));

        let stats = reader.stats().snapshot();
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.bytes, 8);
    }

    #[test]
    fn test_drops_are_counted_and_reading_continues() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m")
            .chunk(b"!x\n0123456789abcdefg\nok\npart", MS)
            .new_input()
            .chunk(b"fresh\n", MS);
        let (mut reader, collector) = reader(channel, &clock);
        while reader.process_read().unwrap().bytes > 0 {}

        let stats = reader.stats().snapshot();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.oversize, 1);
        assert_eq!(stats.incomplete, 1);
        assert_eq!(stats.dropped(), 3);
        let kept: Vec<Vec<u8>> = collector.take().iter().map(|s| s.data::<u8>().unwrap().to_vec()).collect();
        assert_eq!(kept, vec![b"g\n".to_vec(), b"ok\n".to_vec(), b"fresh\n".to_vec()]);
    }

    #[test]
    fn test_adjuster_regularizes_time_tags() {
        let clock = ManualClock::new(1_000_000);
        // 10 Hz with jittered arrival
        let channel = MockChannel::new("m")
            .chunk(b"a\n", 100 * MS)
            .chunk(b"b\n", 130 * MS)
            .chunk(b"c\n", 70 * MS);
        let (reader, collector) = reader(channel, &clock);
        let mut reader = reader.with_adjuster(TimetagAdjuster::new(10.0, 10.0).unwrap());
        while reader.process_read().unwrap().bytes > 0 {}

        let tags: Vec<i64> = collector.take().iter().map(|s| s.timetag()).collect();
        assert_eq!(tags, vec![1_100_000, 1_200_000, 1_300_000]);
        assert!(reader.adjuster().unwrap().is_locked());
    }

    #[test]
    fn test_channel_failure_ends_reader() {
        let clock = ManualClock::new(0);
        let channel = MockChannel::new("m")
            .would_block()
            .fail(std::io::ErrorKind::ConnectionReset);
        let (mut reader, _) = reader(channel, &clock);
        assert_eq!(reader.process_read().unwrap().bytes, 0);
        assert!(reader.process_read().is_err());
        assert_eq!(reader.io_stats().would_block, 1);
    }

    #[test]
    #[traced_test]
    fn test_drop_warnings_are_rate_limited() {
        let clock = ManualClock::new(0);
        let mut channel = MockChannel::new("m");
        for _ in 0..25 {
            channel = channel.chunk(b"!\n", MS);
        }
        let (reader, _) = reader(channel, &clock);
        let mut reader = reader.with_log_every(10);
        while reader.process_read().unwrap().bytes > 0 {}

        assert_eq!(reader.stats().snapshot().malformed, 25);
        logs_assert(|lines: &[&str]| {
            let warned = lines
                .iter()
                .filter(|l| l.contains("WARN") && l.contains("Dropped message"))
                .count();
            // occurrences 1, 11 and 21
            if warned == 3 {
                Ok(())
            } else {
                Err(format!("expected 3 warnings, got {warned}"))
            }
        });
    }
}
