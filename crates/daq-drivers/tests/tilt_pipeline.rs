//! Tilt frames from a channel all the way to fan-out clients.

use std::sync::Arc;
use std::time::Duration;

use daq_core::clock::{system_clock, ManualClock};
use daq_core::config::AcquisitionConfig;
use daq_core::decoder::DecoderRegistry;
use daq_core::fanout::{ClientFilter, SampleClient, SampleCollector, SampleSource};
use daq_drivers::{register_builtin, TiltDecoder, TiltOptions};
use daq_io::channels::mock::MockChannel;
use daq_io::{Framing, IoStream, IoStreamConfig, Scanner, SensorReader};
use daq_pool::{SampleId, SamplePool};

const FRAME: &[u8] = b"\xff\x01\xbb\xff\x2e\xe9";
const CORRUPT: &[u8] = b"\xff\x01\xbb\xff\x2e\x00";
const T0: i64 = 1_700_000_000_000_000;

#[test]
fn three_good_frames_and_one_corrupt() {
    let clock = ManualClock::new(T0);
    let step = Duration::from_millis(180);
    let channel = MockChannel::new("tilt")
        .chunk(FRAME, step)
        .chunk(FRAME, step)
        .chunk(FRAME, step)
        .chunk(CORRUPT, step)
        .with_clock(clock.clone());

    let id = SampleId::new(1, 40);
    let pool = Arc::new(SamplePool::default());
    let source = Arc::new(SampleSource::new("tilt"));
    let collector = Arc::new(SampleCollector::new());
    source.add_client(ClientFilter::Id(id), Arc::clone(&collector) as Arc<dyn SampleClient>);

    let framing = Framing::Separator {
        separator: vec![0xff],
        at_end: false,
        length: 6,
    };
    let io = IoStream::new(channel, Arc::new(clock.clone()), IoStreamConfig::for_message_size(6));
    let mut reader = SensorReader::new(
        "tilt",
        id,
        io,
        Scanner::new(framing, 64).unwrap(),
        Box::new(TiltDecoder::new(id, &TiltOptions::default())),
        Arc::clone(&pool),
        source,
    );

    let mut messages = 0;
    loop {
        let outcome = reader.process_read().unwrap();
        if outcome.bytes == 0 {
            break;
        }
        messages += 1;
    }
    assert_eq!(messages, 4);

    let samples = collector.take();
    assert_eq!(samples.len(), 3);
    for (n, sample) in samples.iter().enumerate() {
        assert_eq!(sample.timetag(), T0 + 180_000 * (n as i64 + 1));
        let values = sample.data::<f32>().unwrap();
        assert!((values[0] - -1.22).abs() < 0.01, "pitch {}", values[0]);
        // 0xff2e = -210 counts, negated for the inverted mount
        assert!((values[1] - 0.55).abs() < 0.05, "roll {}", values[1]);
    }

    let stats = reader.stats().snapshot();
    assert_eq!(stats.bad_checksum, 1);
    assert_eq!(stats.messages, 4);
    assert_eq!(stats.samples, 3);

    drop(samples);
    assert_eq!(pool.stats().outstanding, 0);
}

#[test]
fn reader_built_from_configuration() {
    let config = AcquisitionConfig::from_toml_str(
        r#"
        [[sensors]]
        name = "tilt"
        class = "tilt"
        dsm_id = 2
        sensor_id = 7

        [sensors.channel]
        type = "mock"
        data = "\\x00\\xff\\x01\\xbb\\xff\\x2e\\xe9"
        interval_ms = 0

        [sensors.framing]
        message_length = 6
        separator = "\\xff"
        separator_at_end = false
        "#,
    )
    .unwrap();

    let mut registry = DecoderRegistry::new();
    register_builtin(&mut registry).unwrap();
    let pool = Arc::new(SamplePool::new(config.pool.to_pool_config()));
    let source = Arc::new(SampleSource::new("all"));
    let collector = Arc::new(SampleCollector::new());
    source.add_client(ClientFilter::All, Arc::clone(&collector) as Arc<dyn SampleClient>);

    let mut reader =
        SensorReader::from_config(&config.sensors[0], &registry, pool, source, system_clock())
            .unwrap();
    assert_eq!(reader.process_read().unwrap().samples, 1);
    assert_eq!(reader.process_read().unwrap().bytes, 0);

    let samples = collector.take();
    assert_eq!(samples[0].id(), SampleId::new(2, 7));
    assert!(reader.adjuster().is_none());
}
