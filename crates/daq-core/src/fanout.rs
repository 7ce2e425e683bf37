//! Synchronous sample fan-out.
//!
//! A [`SampleSource`] delivers every finished sample to each registered
//! [`SampleClient`] whose filter matches, in registration order, on the
//! calling thread.
//!
//! # Architecture
//!
//! ```text
//! SensorReader → SampleSource → [client 1, client 2, ...]
//!                                   ↓           ↓
//!                              QueueClient   SampleCollector
//!                              (to async     (retains samples)
//!                               stages)
//! ```
//!
//! The source takes one reference per matching client *before* calling any
//! of them and releases its own reference after the last callback returns.
//! A client that wants the sample beyond its callback simply keeps the
//! [`Sample`] it was given. Queuing is the client's business; the source
//! only fans out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use daq_pool::{Sample, SampleId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

/// Receiver of distributed samples.
pub trait SampleClient: Send + Sync {
    /// Consume one sample. `true` means accepted, `false` rejected.
    fn receive(&self, sample: Sample) -> bool;

    /// Name used in metrics.
    fn name(&self) -> &str {
        "client"
    }
}

/// Which samples a client subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFilter {
    /// Every sample.
    All,
    /// Samples with exactly this id.
    Id(SampleId),
}

impl ClientFilter {
    /// Whether a sample with `id` passes.
    #[must_use]
    pub fn matches(&self, id: SampleId) -> bool {
        match self {
            ClientFilter::All => true,
            ClientFilter::Id(wanted) => *wanted == id,
        }
    }
}

#[derive(Debug, Default)]
struct ClientMetrics {
    delivered: AtomicU64,
    rejected: AtomicU64,
}

struct ClientEntry {
    filter: ClientFilter,
    client: Arc<dyn SampleClient>,
    metrics: Arc<ClientMetrics>,
}

/// Delivery counters for one registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    /// Client name.
    pub client: String,
    /// Filter the client registered with.
    pub filter: ClientFilter,
    /// Samples the client accepted.
    pub delivered: u64,
    /// Samples the client refused.
    pub rejected: u64,
}

/// Publish/subscribe point for one producer.
pub struct SampleSource {
    name: String,
    clients: RwLock<Vec<ClientEntry>>,
    distributed: AtomicU64,
}

impl fmt::Debug for SampleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSource")
            .field("name", &self.name)
            .field("clients", &self.client_count())
            .field("distributed", &self.distributed())
            .finish()
    }
}

impl SampleSource {
    /// Source with no clients.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: RwLock::new(Vec::new()),
            distributed: AtomicU64::new(0),
        }
    }

    /// Source name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe `client` to samples matching `filter`.
    ///
    /// The same client may be registered under several filters.
    pub fn add_client(&self, filter: ClientFilter, client: Arc<dyn SampleClient>) {
        self.clients.write().push(ClientEntry {
            filter,
            client,
            metrics: Arc::new(ClientMetrics::default()),
        });
    }

    /// Remove one registration of `client` under `filter`.
    ///
    /// Returns whether a registration was removed. Other clients keep
    /// their relative order.
    pub fn remove_client(&self, filter: ClientFilter, client: &Arc<dyn SampleClient>) -> bool {
        let mut clients = self.clients.write();
        match clients
            .iter()
            .position(|c| c.filter == filter && Arc::ptr_eq(&c.client, client))
        {
            Some(index) => {
                clients.remove(index);
                true
            }
            None => false,
        }
    }

    /// Deliver `sample` to every matching client, returning how many
    /// accepted it.
    pub fn distribute(&self, sample: Sample) -> usize {
        self.distributed.fetch_add(1, Ordering::Relaxed);

        // Snapshot under the lock so callbacks may add or remove clients.
        let targets: Vec<(Arc<dyn SampleClient>, Arc<ClientMetrics>)> = self
            .clients
            .read()
            .iter()
            .filter(|c| c.filter.matches(sample.id()))
            .map(|c| (Arc::clone(&c.client), Arc::clone(&c.metrics)))
            .collect();

        let references: Vec<Sample> = targets.iter().map(|_| sample.clone()).collect();

        let mut accepted = 0;
        for ((client, metrics), reference) in targets.into_iter().zip(references) {
            if client.receive(reference) {
                metrics.delivered.fetch_add(1, Ordering::Relaxed);
                accepted += 1;
            } else {
                metrics.rejected.fetch_add(1, Ordering::Relaxed);
                trace!(source = %self.name, client = client.name(), id = %sample.id(), "Sample rejected");
            }
        }
        accepted
    }

    /// Registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Samples passed to [`distribute`](Self::distribute) so far.
    #[must_use]
    pub fn distributed(&self) -> u64 {
        self.distributed.load(Ordering::Relaxed)
    }

    /// Delivery counters, in registration order.
    #[must_use]
    pub fn client_metrics(&self) -> Vec<ClientMetricsSnapshot> {
        self.clients
            .read()
            .iter()
            .map(|c| ClientMetricsSnapshot {
                client: c.client.name().to_string(),
                filter: c.filter,
                delivered: c.metrics.delivered.load(Ordering::Relaxed),
                rejected: c.metrics.rejected.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Adapts a closure into a [`SampleClient`].
pub struct FnClient<F> {
    name: String,
    f: F,
}

impl<F> FnClient<F>
where
    F: Fn(Sample) -> bool + Send + Sync,
{
    /// Wrap `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> SampleClient for FnClient<F>
where
    F: Fn(Sample) -> bool + Send + Sync,
{
    fn receive(&self, sample: Sample) -> bool {
        (self.f)(sample)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Client that keeps every sample it accepts.
///
/// With a limit, samples beyond it are rejected rather than retained.
#[derive(Debug, Default)]
pub struct SampleCollector {
    samples: Mutex<Vec<Sample>>,
    limit: Option<usize>,
}

impl SampleCollector {
    /// Collector without a limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector that rejects samples once it holds `limit`.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            limit: Some(limit),
        }
    }

    /// Samples held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether no samples are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Copies of the retained references.
    #[must_use]
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Hand over (and stop retaining) everything collected so far.
    pub fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.samples.lock())
    }
}

impl SampleClient for SampleCollector {
    fn receive(&self, sample: Sample) -> bool {
        let mut samples = self.samples.lock();
        if self.limit.is_some_and(|limit| samples.len() >= limit) {
            return false;
        }
        samples.push(sample);
        true
    }

    fn name(&self) -> &str {
        "collector"
    }
}

/// Hands samples to a bounded async queue without blocking the producer.
///
/// A full queue drops the sample (counted) instead of stalling acquisition.
#[derive(Debug)]
pub struct QueueClient {
    name: String,
    sender: mpsc::Sender<Sample>,
    dropped: AtomicU64,
}

impl QueueClient {
    /// Create the client and the receiving end of its queue.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Sample>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let client = Arc::new(Self {
            name: name.into(),
            sender,
            dropped: AtomicU64::new(0),
        });
        (client, receiver)
    }

    /// Samples dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SampleClient for QueueClient {
    fn receive(&self, sample: Sample) -> bool {
        match self.sender.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_pool::{SamplePool, SampleType};

    fn sample(pool: &SamplePool, id: SampleId) -> Sample {
        let mut s = pool.acquire(SampleType::Float, 1).unwrap();
        s.set_id(id);
        s.freeze()
    }

    #[test]
    fn test_registration_order_and_filtering() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let source = SampleSource::new("test");
        let a = SampleId::new(1, 1);
        let b = SampleId::new(1, 2);

        for (name, filter) in [
            ("first", ClientFilter::All),
            ("only_b", ClientFilter::Id(b)),
            ("last", ClientFilter::All),
        ] {
            let order = Arc::clone(&order);
            source.add_client(
                filter,
                Arc::new(FnClient::new(name, move |_s: Sample| {
                    order.lock().push(name);
                    true
                })),
            );
        }

        let pool = SamplePool::default();
        assert_eq!(source.distribute(sample(&pool, a)), 2);
        assert_eq!(source.distribute(sample(&pool, b)), 3);
        assert_eq!(
            *order.lock(),
            vec!["first", "last", "first", "only_b", "last"]
        );
    }

    #[test]
    fn test_references_taken_before_callbacks() {
        let pool = SamplePool::default();
        let source = SampleSource::new("refs");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            source.add_client(
                ClientFilter::All,
                Arc::new(FnClient::new("count", move |s: Sample| {
                    seen.lock().push(s.ref_count());
                    true
                })),
            );
        }
        source.distribute(sample(&pool, SampleId::default()));
        // source + 3 client references on entry to the first callback
        assert_eq!(seen.lock()[0], 4);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_retained_sample_outlives_distribution() {
        let pool = SamplePool::default();
        let source = SampleSource::new("retain");
        let collector = Arc::new(SampleCollector::new());
        source.add_client(ClientFilter::All, collector.clone());

        source.distribute(sample(&pool, SampleId::default()));
        assert_eq!(pool.stats().outstanding, 1);
        assert_eq!(collector.samples()[0].ref_count(), 2);

        drop(collector.take());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_remove_client() {
        let source = SampleSource::new("rm");
        let collector: Arc<dyn SampleClient> = Arc::new(SampleCollector::new());
        let id = SampleId::new(2, 3);
        source.add_client(ClientFilter::Id(id), Arc::clone(&collector));
        assert!(!source.remove_client(ClientFilter::All, &collector));
        assert!(source.remove_client(ClientFilter::Id(id), &collector));
        assert_eq!(source.client_count(), 0);
        assert!(!source.remove_client(ClientFilter::Id(id), &collector));
    }

    #[test]
    fn test_rejections_are_counted() {
        let pool = SamplePool::default();
        let source = SampleSource::new("limit");
        source.add_client(ClientFilter::All, Arc::new(SampleCollector::with_limit(1)));
        source.distribute(sample(&pool, SampleId::default()));
        source.distribute(sample(&pool, SampleId::default()));

        let metrics = source.client_metrics();
        assert_eq!(metrics[0].delivered, 1);
        assert_eq!(metrics[0].rejected, 1);
        assert_eq!(source.distributed(), 2);
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[test]
    fn test_queue_client_drops_when_full() {
        let pool = SamplePool::default();
        let (client, mut rx) = QueueClient::new("queue", 1);
        let source = SampleSource::new("q");
        source.add_client(ClientFilter::All, client.clone());

        assert_eq!(source.distribute(sample(&pool, SampleId::new(0, 1))), 1);
        assert_eq!(source.distribute(sample(&pool, SampleId::new(0, 2))), 0);
        assert_eq!(client.dropped(), 1);

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.id(), SampleId::new(0, 1));
        drop(queued);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
