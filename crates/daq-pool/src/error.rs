//! Pool and sample errors.

use thiserror::Error;

use crate::sample::SampleType;

/// Errors surfaced to callers of the pool and of [`SampleMut`](crate::SampleMut).
///
/// These are request-validation failures; none of them leave the pool's
/// bookkeeping in an inconsistent state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Requested length exceeds what a sample may hold.
    #[error("sample length {requested} exceeds maximum {max}")]
    SampleLength { requested: usize, max: usize },

    /// A byte length that does not divide into whole elements.
    #[error("byte length {bytes} is not a multiple of element size {element_size}")]
    MisalignedLength { bytes: usize, element_size: usize },

    /// Typed access with the wrong element type.
    #[error("sample holds {actual} elements, not {expected}")]
    TypeMismatch {
        expected: SampleType,
        actual: SampleType,
    },
}
