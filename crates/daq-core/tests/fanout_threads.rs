//! Fan-out from several producer threads into shared clients.

use std::sync::Arc;
use std::thread;

use daq_core::fanout::{ClientFilter, QueueClient, SampleClient, SampleCollector, SampleSource};
use daq_pool::{SampleId, SamplePool, SampleType};

const PRODUCERS: u16 = 4;
const PER_PRODUCER: usize = 250;

#[test]
fn buffers_return_to_pool_after_concurrent_fan_out() {
    let pool = Arc::new(SamplePool::default());
    let source = Arc::new(SampleSource::new("shared"));

    let collector = Arc::new(SampleCollector::new());
    source.add_client(
        ClientFilter::Id(SampleId::new(1, 0)),
        Arc::clone(&collector) as Arc<dyn SampleClient>,
    );
    let (queue, mut rx) = QueueClient::new("queue", 64);
    source.add_client(ClientFilter::All, Arc::clone(&queue) as Arc<dyn SampleClient>);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|sensor| {
            let pool = Arc::clone(&pool);
            let source = Arc::clone(&source);
            thread::spawn(move || {
                for n in 0..PER_PRODUCER {
                    let mut s = pool.acquire(SampleType::Double, 3).unwrap();
                    s.copy_from(&[n as f64, 0.0, 1.0]).unwrap();
                    s.set_id(SampleId::new(1, sensor));
                    source.distribute(s.freeze());
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let total = u64::from(PRODUCERS) * PER_PRODUCER as u64;
    assert_eq!(source.distributed(), total);
    assert_eq!(collector.len(), PER_PRODUCER);

    let mut queued = 0u64;
    while rx.try_recv().is_ok() {
        queued += 1;
    }
    assert_eq!(queued + queue.dropped(), total);
    assert_eq!(queued, 64);

    let metrics = source.client_metrics();
    assert_eq!(metrics[0].delivered, PER_PRODUCER as u64);
    assert_eq!(metrics[1].delivered + metrics[1].rejected, total);

    // Only the collector still holds samples.
    assert_eq!(pool.stats().outstanding, PER_PRODUCER);
    drop(collector.take());
    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.allocated, stats.free());
}
