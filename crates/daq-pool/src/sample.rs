//! Typed, time-tagged sample buffers.
//!
//! A sample moves through two stages:
//!
//! ```text
//! SamplePool::acquire() -> SampleMut   (one producer, mutable)
//! SampleMut::freeze()   -> Sample      (shared, read-only, Clone = +1 ref)
//! last Sample dropped   -> buffer returned to the pool
//! ```
//!
//! The data buffer is kept at its full allocated capacity; the logical
//! length is tracked separately so a recycled buffer never has to shrink.

use std::fmt;
use std::sync::Arc;

use crate::error::PoolError;
use crate::PoolInner;

/// Time tag in microseconds since the Unix epoch.
pub type Timetag = i64;

/// Microseconds per second.
pub const USECS_PER_SEC: i64 = 1_000_000;

/// Element type of a sample's data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleType {
    /// `i8`
    Char,
    /// `u8`
    UChar,
    /// `i16`
    Short,
    /// `u16`
    UShort,
    /// `i32`
    Int32,
    /// `u32`
    UInt32,
    /// `i64`
    Int64,
    /// `f32`
    Float,
    /// `f64`
    Double,
}

impl SampleType {
    /// Every element type, in pool index order.
    pub const ALL: [SampleType; 9] = [
        SampleType::Char,
        SampleType::UChar,
        SampleType::Short,
        SampleType::UShort,
        SampleType::Int32,
        SampleType::UInt32,
        SampleType::Int64,
        SampleType::Float,
        SampleType::Double,
    ];

    /// Size of one element in bytes.
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            SampleType::Char | SampleType::UChar => 1,
            SampleType::Short | SampleType::UShort => 2,
            SampleType::Int32 | SampleType::UInt32 | SampleType::Float => 4,
            SampleType::Int64 | SampleType::Double => 8,
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Lower-case type name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SampleType::Char => "char",
            SampleType::UChar => "uchar",
            SampleType::Short => "short",
            SampleType::UShort => "ushort",
            SampleType::Int32 => "int32",
            SampleType::UInt32 => "uint32",
            SampleType::Int64 => "int64",
            SampleType::Float => "float",
            SampleType::Double => "double",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric sample identifier.
///
/// Packs a 10-bit data-system id into bits 16..26 and a 16-bit
/// sensor/sample id into the low bits, so one `u32` names both the
/// source and the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SampleId(u32);

impl SampleId {
    const DSM_MASK: u32 = 0x3ff;

    /// Largest data-system id that fits.
    pub const MAX_DSM_ID: u16 = Self::DSM_MASK as u16;

    /// Pack `dsm_id` (10 bits) and `sensor_id`.
    #[must_use]
    pub const fn new(dsm_id: u16, sensor_id: u16) -> Self {
        Self(((dsm_id as u32 & Self::DSM_MASK) << 16) | sensor_id as u32)
    }

    /// Id from its packed value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & ((Self::DSM_MASK << 16) | 0xffff))
    }

    /// Packed value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Data system id.
    #[must_use]
    pub const fn dsm_id(self) -> u16 {
        ((self.0 >> 16) & Self::DSM_MASK) as u16
    }

    /// Sensor id within the data system.
    #[must_use]
    pub const fn sensor_id(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Same data system, different sensor/sample id.
    #[must_use]
    pub const fn with_sensor_id(self, sensor_id: u16) -> Self {
        Self::new(self.dsm_id(), sensor_id)
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.dsm_id(), self.sensor_id())
    }
}

/// Storage for a sample's elements, one variant per [`SampleType`].
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    /// `i8` elements.
    Char(Vec<i8>),
    /// `u8` elements.
    UChar(Vec<u8>),
    /// `i16` elements.
    Short(Vec<i16>),
    /// `u16` elements.
    UShort(Vec<u16>),
    /// `i32` elements.
    Int32(Vec<i32>),
    /// `u32` elements.
    UInt32(Vec<u32>),
    /// `i64` elements.
    Int64(Vec<i64>),
    /// `f32` elements.
    Float(Vec<f32>),
    /// `f64` elements.
    Double(Vec<f64>),
}

macro_rules! with_vec {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            SampleData::Char($v) => $body,
            SampleData::UChar($v) => $body,
            SampleData::Short($v) => $body,
            SampleData::UShort($v) => $body,
            SampleData::Int32($v) => $body,
            SampleData::UInt32($v) => $body,
            SampleData::Int64($v) => $body,
            SampleData::Float($v) => $body,
            SampleData::Double($v) => $body,
        }
    };
}

impl Default for SampleData {
    fn default() -> Self {
        SampleData::UChar(Vec::new())
    }
}

impl SampleData {
    /// Allocate a zero-filled buffer of `capacity` elements.
    #[must_use]
    pub fn with_capacity(sample_type: SampleType, capacity: usize) -> Self {
        match sample_type {
            SampleType::Char => SampleData::Char(vec![0; capacity]),
            SampleType::UChar => SampleData::UChar(vec![0; capacity]),
            SampleType::Short => SampleData::Short(vec![0; capacity]),
            SampleType::UShort => SampleData::UShort(vec![0; capacity]),
            SampleType::Int32 => SampleData::Int32(vec![0; capacity]),
            SampleType::UInt32 => SampleData::UInt32(vec![0; capacity]),
            SampleType::Int64 => SampleData::Int64(vec![0; capacity]),
            SampleType::Float => SampleData::Float(vec![0.0; capacity]),
            SampleType::Double => SampleData::Double(vec![0.0; capacity]),
        }
    }

    /// Element type of this storage.
    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        match self {
            SampleData::Char(_) => SampleType::Char,
            SampleData::UChar(_) => SampleType::UChar,
            SampleData::Short(_) => SampleType::Short,
            SampleData::UShort(_) => SampleType::UShort,
            SampleData::Int32(_) => SampleType::Int32,
            SampleData::UInt32(_) => SampleType::UInt32,
            SampleData::Int64(_) => SampleType::Int64,
            SampleData::Float(_) => SampleType::Float,
            SampleData::Double(_) => SampleType::Double,
        }
    }

    /// Allocated capacity in elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        with_vec!(self, v => v.len())
    }

    /// Grow to at least `capacity` elements. Never shrinks.
    pub(crate) fn grow(&mut self, capacity: usize) {
        if self.capacity() < capacity {
            with_vec!(self, v => v.resize(capacity, Default::default()));
        }
    }

    /// Overwrite elements from `from` to the end of the allocation with a
    /// recognizable sentinel, so reads past the logical length stand out.
    pub(crate) fn poison_tail(&mut self, from: usize) {
        match self {
            SampleData::Char(v) => poison(v, from, i8::MIN),
            SampleData::UChar(v) => poison(v, from, POISON_BYTE),
            SampleData::Short(v) => poison(v, from, i16::MIN),
            SampleData::UShort(v) => poison(v, from, u16::MAX),
            SampleData::Int32(v) => poison(v, from, i32::MIN),
            SampleData::UInt32(v) => poison(v, from, u32::MAX),
            SampleData::Int64(v) => poison(v, from, i64::MIN),
            SampleData::Float(v) => poison(v, from, f32::NAN),
            SampleData::Double(v) => poison(v, from, f64::NAN),
        }
    }

    /// Element `index` widened to `f64`.
    #[must_use]
    pub fn value_f64(&self, index: usize) -> Option<f64> {
        with_vec!(self, v => v.get(index).map(|&x| x as f64))
    }
}

/// Byte written past the logical length of recycled byte buffers.
pub const POISON_BYTE: u8 = 0xa5;

fn poison<T: Copy>(v: &mut [T], from: usize, value: T) {
    if from < v.len() {
        v[from..].fill(value);
    }
}

/// Rust element types that map onto a [`SampleType`].
pub trait SampleElement: Copy + Default + Send + Sync + 'static {
    /// Matching element type.
    const TYPE: SampleType;

    /// Elements of `data`, when they are of this type.
    fn slice(data: &SampleData) -> Option<&[Self]>;

    /// Mutable elements of `data`, when they are of this type.
    fn slice_mut(data: &mut SampleData) -> Option<&mut [Self]>;
}

macro_rules! sample_element {
    ($t:ty, $variant:ident) => {
        impl SampleElement for $t {
            const TYPE: SampleType = SampleType::$variant;

            fn slice(data: &SampleData) -> Option<&[Self]> {
                match data {
                    SampleData::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut SampleData) -> Option<&mut [Self]> {
                match data {
                    SampleData::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }
        }
    };
}

sample_element!(i8, Char);
sample_element!(u8, UChar);
sample_element!(i16, Short);
sample_element!(u16, UShort);
sample_element!(i32, Int32);
sample_element!(u32, UInt32);
sample_element!(i64, Int64);
sample_element!(f32, Float);
sample_element!(f64, Double);

/// Shared state behind both [`SampleMut`] and [`Sample`].
///
/// Dropping a slot hands its data buffer back to the owning pool.
pub(crate) struct SampleSlot {
    timetag: Timetag,
    id: SampleId,
    len: usize,
    data: SampleData,
    pool: Option<Arc<PoolInner>>,
}

impl SampleSlot {
    pub(crate) fn new(data: SampleData, len: usize, pool: Option<Arc<PoolInner>>) -> Self {
        Self {
            timetag: 0,
            id: SampleId::default(),
            len,
            data,
            pool,
        }
    }
}

impl Drop for SampleSlot {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for SampleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("timetag", &self.timetag)
            .field("id", &self.id)
            .field("type", &self.data.sample_type())
            .field("len", &self.len)
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

/// A sample being filled by its producer.
///
/// Exclusively owned; nothing else can observe it until [`freeze`](Self::freeze).
/// Dropping it unfrozen returns the buffer to the pool.
#[derive(Debug)]
pub struct SampleMut {
    slot: SampleSlot,
}

impl SampleMut {
    pub(crate) fn new(slot: SampleSlot) -> Self {
        Self { slot }
    }

    /// A sample that does not belong to any pool.
    #[must_use]
    pub fn detached(sample_type: SampleType, len: usize) -> Self {
        Self::new(SampleSlot::new(
            SampleData::with_capacity(sample_type, len),
            len,
            None,
        ))
    }

    /// Acquisition time in microseconds.
    #[must_use]
    pub fn timetag(&self) -> Timetag {
        self.slot.timetag
    }

    /// Stamp the acquisition time.
    pub fn set_timetag(&mut self, timetag: Timetag) {
        self.slot.timetag = timetag;
    }

    /// Series identifier.
    #[must_use]
    pub fn id(&self) -> SampleId {
        self.slot.id
    }

    /// Set the series identifier.
    pub fn set_id(&mut self, id: SampleId) {
        self.slot.id = id;
    }

    /// Element type.
    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.slot.data.sample_type()
    }

    /// Logical length in elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slot.len
    }

    /// Whether the logical length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    /// Allocated elements, at least `len`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot.data.capacity()
    }

    /// Change the logical length within the allocated capacity.
    pub fn set_len(&mut self, len: usize) -> Result<(), PoolError> {
        let capacity = self.capacity();
        if len > capacity {
            return Err(PoolError::SampleLength {
                requested: len,
                max: capacity,
            });
        }
        self.slot.len = len;
        Ok(())
    }

    /// Elements up to the logical length, if `T` matches the sample type.
    #[must_use]
    pub fn data<T: SampleElement>(&self) -> Option<&[T]> {
        T::slice(&self.slot.data).map(|s| &s[..self.slot.len])
    }

    /// Mutable elements up to the logical length, if `T` matches the sample type.
    #[must_use]
    pub fn data_mut<T: SampleElement>(&mut self) -> Option<&mut [T]> {
        let len = self.slot.len;
        T::slice_mut(&mut self.slot.data).map(|s| &mut s[..len])
    }

    /// Copy `values` in and set the logical length to `values.len()`.
    pub fn copy_from<T: SampleElement>(&mut self, values: &[T]) -> Result<(), PoolError> {
        let actual = self.sample_type();
        let capacity = self.capacity();
        let slice = T::slice_mut(&mut self.slot.data).ok_or(PoolError::TypeMismatch {
            expected: T::TYPE,
            actual,
        })?;
        if values.len() > capacity {
            return Err(PoolError::SampleLength {
                requested: values.len(),
                max: capacity,
            });
        }
        slice[..values.len()].copy_from_slice(values);
        self.slot.len = values.len();
        Ok(())
    }

    /// Publish the sample. The result is read-only and cheaply clonable.
    #[must_use]
    pub fn freeze(self) -> Sample {
        Sample {
            inner: Arc::new(self.slot),
        }
    }
}

/// A finished, shared, read-only sample.
///
/// `Clone` takes another reference; the buffer goes back to its pool when
/// the last reference is dropped.
#[derive(Clone, Debug)]
pub struct Sample {
    inner: Arc<SampleSlot>,
}

impl Sample {
    /// Acquisition time in microseconds.
    #[must_use]
    pub fn timetag(&self) -> Timetag {
        self.inner.timetag
    }

    /// Series identifier.
    #[must_use]
    pub fn id(&self) -> SampleId {
        self.inner.id
    }

    /// Element type.
    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.inner.data.sample_type()
    }

    /// Logical length in elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the logical length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Allocated elements, at least `len`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.data.capacity()
    }

    /// Number of live references, including this one.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Elements up to the logical length, `None` if `T` is not the element type.
    #[must_use]
    pub fn data<T: SampleElement>(&self) -> Option<&[T]> {
        T::slice(&self.inner.data).map(|s| &s[..self.inner.len])
    }

    /// Element `index` widened to `f64`, `None` past the logical length.
    #[must_use]
    pub fn value_f64(&self, index: usize) -> Option<f64> {
        if index >= self.inner.len {
            return None;
        }
        self.inner.data.value_f64(index)
    }

    /// All elements widened to `f64`.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.inner.len)
            .filter_map(|i| self.inner.data.value_f64(i))
            .collect()
    }

    /// Whole allocation, including any bytes past the logical length.
    #[must_use]
    pub fn raw_data(&self) -> &SampleData {
        &self.inner.data
    }
}
