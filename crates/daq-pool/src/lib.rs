//! Size-segregated sample pool for high-rate acquisition.
//!
//! Acquisition threads produce many small samples per second (A2D scans,
//! ARINC labels, serial records). Allocating a fresh buffer for each would
//! churn the heap, so finished samples hand their buffers back here and the
//! next `acquire()` reuses them.
//!
//! # Design
//!
//! - One set of free lists per [`SampleType`], each split into three size
//!   classes (small / medium / large) by element capacity.
//! - A request is served from the smallest class that fits. If that class is
//!   empty, a larger class is raided only when it has more than
//!   `borrow_min_spares` buffers, so bursts of big samples don't starve the
//!   small class (and vice versa).
//! - Exhaustion never blocks: an empty pool allocates a new buffer.
//! - Free lists grow by 50% when full. With `max_free_per_class` set, a
//!   buffer returned to a full class is freed instead.
//! - All bookkeeping is behind one `parking_lot::Mutex`, held only for the
//!   list operation itself.
//!
//! The pool is an ordinary value: construct one at startup and hand clones
//! to every acquisition component.
//!
//! # Example
//!
//! ```
//! use daq_pool::{SamplePool, SampleType};
//!
//! let pool = SamplePool::default();
//! let mut sample = pool.acquire(SampleType::Float, 3).unwrap();
//! sample.data_mut::<f32>().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
//! sample.set_timetag(1_700_000_000_000_000);
//!
//! let shared = sample.freeze();
//! let for_consumer = shared.clone();
//! assert_eq!(pool.stats().outstanding, 1);
//!
//! drop(shared);
//! drop(for_consumer);
//! assert_eq!(pool.stats().outstanding, 0);
//! ```

pub mod error;
pub mod sample;

pub use error::PoolError;
pub use sample::{
    Sample, SampleData, SampleElement, SampleId, SampleMut, SampleType, Timetag, POISON_BYTE,
    USECS_PER_SEC,
};

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use sample::SampleSlot;

/// Pool sizing and policy knobs.
///
/// The defaults are tuned starting points, not derived optima.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Largest element count held in the small class.
    pub small_max_elements: usize,
    /// Largest element count held in the medium class.
    pub medium_max_elements: usize,
    /// Byte budget used to pre-size the free lists.
    pub initial_bytes: usize,
    /// Upper bound on buffers kept per class; extra returns are freed.
    pub max_free_per_class: Option<usize>,
    /// A larger class lends a buffer only when it holds more than this many.
    pub borrow_min_spares: usize,
    /// Longest sample (in elements) a caller may request.
    pub max_sample_length: usize,
    /// Fill bytes past the logical length with a sentinel on acquire.
    pub poison: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_max_elements: 64,
            medium_max_elements: 512,
            initial_bytes: 1024 * 1024,
            max_free_per_class: None,
            borrow_min_spares: 2,
            max_sample_length: 4 * 1024 * 1024,
            poison: cfg!(debug_assertions),
        }
    }
}

/// Capacity tier of a free buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Up to `small_max_elements`.
    Small = 0,
    /// Up to `medium_max_elements`.
    Medium = 1,
    /// Anything larger.
    Large = 2,
}

impl SizeClass {
    const ALL: [SizeClass; 3] = [SizeClass::Small, SizeClass::Medium, SizeClass::Large];
}

/// Point-in-time pool counters.
///
/// `allocated == free_small + free_medium + free_large + outstanding`
/// holds for every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently in existence (free or loaned).
    pub allocated: usize,
    /// Buffers held by producers or consumers.
    pub outstanding: usize,
    /// Free buffers in the small class.
    pub free_small: usize,
    /// Free buffers in the medium class.
    pub free_medium: usize,
    /// Free buffers in the large class.
    pub free_large: usize,
    /// Buffers freed because their class was at `max_free_per_class`.
    pub deleted: u64,
    /// Free-list growth events.
    pub grown: u64,
}

impl PoolStats {
    /// Free buffers across all classes.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free_small + self.free_medium + self.free_large
    }
}

struct FreeList {
    buffers: Vec<SampleData>,
    limit: usize,
}

impl FreeList {
    fn with_limit(limit: usize) -> Self {
        Self {
            buffers: Vec::with_capacity(limit),
            limit,
        }
    }
}

struct PoolState {
    /// Indexed by `SampleType::index()`, then by `SizeClass`.
    free: Vec<[FreeList; 3]>,
    allocated: usize,
    outstanding: usize,
    deleted: u64,
    grown: u64,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn classify(&self, len: usize) -> SizeClass {
        if len <= self.config.small_max_elements {
            SizeClass::Small
        } else if len <= self.config.medium_max_elements {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    /// Take back a buffer from a dropped sample.
    pub(crate) fn recycle(&self, data: SampleData) {
        let class = self.classify(data.capacity());
        let type_index = data.sample_type().index();

        let discard = {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);

            let full = self
                .config
                .max_free_per_class
                .is_some_and(|max| state.free[type_index][class as usize].buffers.len() >= max);
            if full {
                state.allocated = state.allocated.saturating_sub(1);
                state.deleted += 1;
                Some(data)
            } else {
                let list = &mut state.free[type_index][class as usize];
                let grew = if list.buffers.len() == list.limit {
                    let extra = (list.limit / 2).max(1);
                    list.limit += extra;
                    list.buffers.reserve_exact(list.limit - list.buffers.len());
                    true
                } else {
                    false
                };
                let new_limit = list.limit;
                list.buffers.push(data);
                if grew {
                    state.grown += 1;
                    debug!(?class, new_limit, "Sample free list grown");
                }
                None
            }
        };
        // freed outside the lock
        drop(discard);
    }
}

/// Process-wide sample allocator.
///
/// Cheap to clone; every clone refers to the same free lists.
#[derive(Clone)]
pub struct SamplePool {
    inner: Arc<PoolInner>,
}

impl Default for SamplePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for SamplePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplePool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SamplePool {
    /// Create a pool, pre-sizing free lists from `config.initial_bytes`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let per_class = config.initial_bytes / 3;
        let nominal = [
            config.small_max_elements,
            config.medium_max_elements,
            config.medium_max_elements.saturating_mul(4),
        ];
        let free = SampleType::ALL
            .iter()
            .map(|t| {
                SizeClass::ALL.map(|class| {
                    let bytes = nominal[class as usize]
                        .saturating_mul(t.element_size())
                        .max(1);
                    // spread the budget across element types
                    let limit = (per_class / bytes / SampleType::ALL.len()).max(4);
                    let limit = config.max_free_per_class.map_or(limit, |max| limit.min(max.max(1)));
                    FreeList::with_limit(limit)
                })
            })
            .collect();

        info!(
            initial_bytes = config.initial_bytes,
            small_max = config.small_max_elements,
            medium_max = config.medium_max_elements,
            "SamplePool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    free,
                    allocated: 0,
                    outstanding: 0,
                    deleted: 0,
                    grown: 0,
                }),
            }),
        }
    }

    /// Configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Size class a request of `len` elements is served from.
    #[must_use]
    pub fn size_class(&self, len: usize) -> SizeClass {
        self.inner.classify(len)
    }

    /// Get a sample of `len` elements of `sample_type`.
    ///
    /// The returned sample has `len() == len` and `capacity() >= len`.
    /// Never blocks; allocates when no suitable free buffer exists.
    pub fn acquire(&self, sample_type: SampleType, len: usize) -> Result<SampleMut, PoolError> {
        let max = self.inner.config.max_sample_length;
        if len > max {
            return Err(PoolError::SampleLength { requested: len, max });
        }

        let class = self.inner.classify(len) as usize;
        let reused = {
            let mut state = self.inner.state.lock();
            let spares = self.inner.config.borrow_min_spares;
            let lists = &mut state.free[sample_type.index()];
            let found = lists[class].buffers.pop().or_else(|| {
                lists[class + 1..]
                    .iter_mut()
                    .find(|l| l.buffers.len() > spares)
                    .and_then(|l| l.buffers.pop())
            });
            if found.is_none() {
                state.allocated += 1;
            }
            state.outstanding += 1;
            found
        };

        let mut data = match reused {
            Some(mut data) => {
                data.grow(len);
                data
            }
            None => SampleData::with_capacity(sample_type, len),
        };
        if self.inner.config.poison {
            data.poison_tail(len);
        }

        Ok(SampleMut::new(SampleSlot::new(
            data,
            len,
            Some(Arc::clone(&self.inner)),
        )))
    }

    /// Get a sample sized by byte length rather than element count.
    pub fn acquire_bytes(
        &self,
        sample_type: SampleType,
        bytes: usize,
    ) -> Result<SampleMut, PoolError> {
        let element_size = sample_type.element_size();
        if bytes % element_size != 0 {
            return Err(PoolError::MisalignedLength {
                bytes,
                element_size,
            });
        }
        self.acquire(sample_type, bytes / element_size)
    }

    /// Snapshot of the pool counters, taken under the pool lock.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats {
            allocated: state.allocated,
            outstanding: state.outstanding,
            deleted: state.deleted,
            grown: state.grown,
            ..PoolStats::default()
        };
        for lists in &state.free {
            stats.free_small += lists[SizeClass::Small as usize].buffers.len();
            stats.free_medium += lists[SizeClass::Medium as usize].buffers.len();
            stats.free_large += lists[SizeClass::Large as usize].buffers.len();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> SamplePool {
        SamplePool::new(PoolConfig {
            small_max_elements: 8,
            medium_max_elements: 64,
            initial_bytes: 0,
            poison: true,
            ..PoolConfig::default()
        })
    }

    fn assert_conserved(pool: &SamplePool) {
        let s = pool.stats();
        assert_eq!(s.allocated, s.free() + s.outstanding, "{s:?}");
    }

    #[test]
    fn test_acquire_reuses_returned_buffer() {
        let pool = small_pool();
        let s = pool.acquire(SampleType::Float, 5).unwrap();
        assert_eq!(s.len(), 5);
        drop(s);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.free_small, 1);

        let s = pool.acquire(SampleType::Float, 3).unwrap();
        assert_eq!(s.len(), 3);
        assert!(s.capacity() >= 5);
        assert_eq!(pool.stats().allocated, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_types_do_not_share_buffers() {
        let pool = small_pool();
        drop(pool.acquire(SampleType::Float, 4).unwrap());
        let s = pool.acquire(SampleType::Double, 4).unwrap();
        assert_eq!(s.sample_type(), SampleType::Double);
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn test_buffer_returns_after_last_reference() {
        let pool = small_pool();
        let shared = pool.acquire(SampleType::UChar, 10).unwrap().freeze();
        let a = shared.clone();
        let b = shared.clone();
        assert_eq!(shared.ref_count(), 3);

        drop(shared);
        drop(a);
        assert_eq!(pool.stats().outstanding, 1);
        drop(b);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().free_medium, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_small_request_borrows_only_from_abundant_class() {
        let pool = small_pool();
        // three medium buffers, borrow_min_spares = 2
        let held: Vec<_> = (0..3)
            .map(|_| pool.acquire(SampleType::Short, 32).unwrap())
            .collect();
        drop(held);
        assert_eq!(pool.stats().free_medium, 3);

        let borrowed = pool.acquire(SampleType::Short, 4).unwrap();
        assert!(borrowed.capacity() >= 32);
        assert_eq!(pool.stats().free_medium, 2);

        // only two spares left: a small request now allocates
        let fresh = pool.acquire(SampleType::Short, 4).unwrap();
        assert_eq!(fresh.capacity(), 4);
        assert_eq!(pool.stats().allocated, 4);
        drop((borrowed, fresh));
        assert_conserved(&pool);
    }

    #[test]
    fn test_length_validation() {
        let pool = SamplePool::new(PoolConfig {
            max_sample_length: 16,
            ..PoolConfig::default()
        });
        assert_eq!(
            pool.acquire(SampleType::Int32, 17).unwrap_err(),
            PoolError::SampleLength { requested: 17, max: 16 }
        );
        assert_eq!(
            pool.acquire_bytes(SampleType::Int32, 6).unwrap_err(),
            PoolError::MisalignedLength { bytes: 6, element_size: 4 }
        );
        // failed requests leave the counters untouched
        assert_eq!(pool.stats().allocated, 0);
        assert_eq!(pool.stats().outstanding, 0);

        assert_eq!(pool.acquire_bytes(SampleType::Int32, 8).unwrap().len(), 2);
    }

    #[test]
    fn test_bounded_class_deletes_extra_buffers() {
        let pool = SamplePool::new(PoolConfig {
            max_free_per_class: Some(1),
            ..PoolConfig::default()
        });
        let a = pool.acquire(SampleType::Double, 2).unwrap();
        let b = pool.acquire(SampleType::Double, 2).unwrap();
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.free_small, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.allocated, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_free_list_grows_by_half() {
        let pool = small_pool();
        let held: Vec<_> = (0..7)
            .map(|_| pool.acquire(SampleType::UChar, 1).unwrap())
            .collect();
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.free_small, 7);
        // initial limit of 4 grows to 6, then to 9
        assert_eq!(stats.grown, 2);
    }

    #[test]
    fn test_poisoned_tail_after_reuse() {
        let pool = small_pool();
        let mut s = pool.acquire(SampleType::Float, 4).unwrap();
        s.copy_from(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        drop(s);

        let s = pool.acquire(SampleType::Float, 2).unwrap().freeze();
        match s.raw_data() {
            SampleData::Float(v) => {
                assert_eq!(&v[..2], &[1.0, 2.0]);
                assert!(v[2].is_nan() && v[3].is_nan());
            }
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = SamplePool::default();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let mut s = pool.acquire(SampleType::Int32, (i * 37 + n) % 700).unwrap();
                        s.set_timetag(n as i64);
                        let shared = s.freeze();
                        let other = shared.clone();
                        drop(shared);
                        drop(other);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_conserved(&pool);
    }
}
