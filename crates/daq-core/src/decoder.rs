//! Sensor decoders and their registry.
//!
//! The scanner hands each framed message to the sensor's [`Decoder`], which
//! turns raw bytes into zero or more typed samples taken from the pool.
//! Decoders are looked up by sensor class name in a [`DecoderRegistry`]
//! populated at startup.
//!
//! # Example
//!
//! ```rust
//! use daq_core::decoder::{Decoder, DecoderContext, DecoderRegistry, RawMessage};
//! use daq_core::error::FrameError;
//! use daq_pool::{SampleMut, SamplePool, SampleType};
//!
//! struct Length;
//!
//! impl Decoder for Length {
//!     fn decode(
//!         &mut self,
//!         message: &RawMessage,
//!         pool: &SamplePool,
//!         out: &mut Vec<SampleMut>,
//!     ) -> Result<(), FrameError> {
//!         let mut s = pool.acquire(SampleType::UInt32, 1)?;
//!         s.copy_from(&[message.data.len() as u32])?;
//!         s.set_timetag(message.timetag);
//!         out.push(s);
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = DecoderRegistry::new();
//! registry.register("length", |_ctx| Ok(Box::new(Length) as Box<dyn Decoder>)).unwrap();
//! assert!(registry.contains("length"));
//! ```

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use daq_pool::{SampleId, SampleMut, SamplePool, Timetag};
use serde::de::DeserializeOwned;

use crate::error::{AppResult, DaqError, FrameError};

/// One framed message, stamped with the estimated time of its first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Acquisition time of the first byte, in microseconds.
    pub timetag: Timetag,
    /// Message bytes, including any separator.
    pub data: Bytes,
}

/// Turns framed bytes into samples.
pub trait Decoder: Send {
    /// Append the samples decoded from `message` to `out`.
    ///
    /// Returning an error drops the message; the reader counts it and goes
    /// on with the next one.
    fn decode(
        &mut self,
        message: &RawMessage,
        pool: &SamplePool,
        out: &mut Vec<SampleMut>,
    ) -> Result<(), FrameError>;
}

/// Everything a decoder factory gets to see about its sensor.
#[derive(Debug, Clone)]
pub struct DecoderContext {
    /// Sensor name.
    pub sensor: String,
    /// Id to stamp on decoded samples.
    pub id: SampleId,
    /// Class-specific options from the sensor's configuration.
    pub options: toml::Value,
}

impl DecoderContext {
    /// Context with an empty options table.
    #[must_use]
    pub fn new(sensor: impl Into<String>, id: SampleId) -> Self {
        Self {
            sensor: sensor.into(),
            id,
            options: toml::Value::Table(toml::map::Map::new()),
        }
    }

    /// Replace the options table.
    #[must_use]
    pub fn with_options(mut self, options: toml::Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the options table into a decoder's own config type.
    pub fn options<T: DeserializeOwned>(&self) -> AppResult<T> {
        self.options.clone().try_into().map_err(|e: toml::de::Error| {
            DaqError::Configuration(format!("sensor '{}': invalid options: {e}", self.sensor))
        })
    }
}

type DecoderFactory = Box<dyn Fn(&DecoderContext) -> AppResult<Box<dyn Decoder>> + Send + Sync>;

/// Decoder factories keyed by sensor class name.
#[derive(Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("classes", &self.names())
            .finish()
    }
}

impl DecoderRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `class`. Class names are unique.
    pub fn register<F>(&mut self, class: impl Into<String>, factory: F) -> AppResult<()>
    where
        F: Fn(&DecoderContext) -> AppResult<Box<dyn Decoder>> + Send + Sync + 'static,
    {
        let class = class.into();
        if self.factories.contains_key(&class) {
            return Err(DaqError::DuplicateDecoder(class));
        }
        self.factories.insert(class, Box::new(factory));
        Ok(())
    }

    /// Build a decoder for a sensor of `class`.
    pub fn create(&self, class: &str, ctx: &DecoderContext) -> AppResult<Box<dyn Decoder>> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| DaqError::UnknownDecoder(class.to_string()))?;
        factory(ctx)
    }

    /// Whether `class` is registered.
    #[must_use]
    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Registered class names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
