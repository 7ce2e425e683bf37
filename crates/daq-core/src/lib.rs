//! `daq-core`
//!
//! Shared types and interfaces of the acquisition core.
//!
//! This crate sits between the sample pool (`daq-pool`) and the byte-stream
//! machinery (`daq-io`). It defines the seams the rest of the workspace
//! plugs into, and the ambient pieces every binary needs.
//!
//! ## Key Types
//!
//! - [`Channel`]: raw byte transport (serial, socket, mock)
//! - [`Decoder`] and [`DecoderRegistry`]: sensor-specific parsing, looked up
//!   by class name
//! - [`TimetagAdjuster`]: drift-compensating time tags for fixed-rate series
//! - [`SampleSource`] and [`SampleClient`]: synchronous fan-out of finished
//!   samples
//! - [`AcquisitionConfig`]: Figment-loaded configuration
//! - [`DaqError`] / [`FrameError`]: application errors vs. per-message
//!   outcomes

pub mod channel;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fanout;
pub mod limits;
pub mod observability;
pub mod timetag;

pub use channel::{usecs_per_byte, Channel, ChannelInterrupt};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::AcquisitionConfig;
pub use decoder::{Decoder, DecoderContext, DecoderRegistry, RawMessage};
pub use error::{AppResult, DaqError, FrameError};
pub use fanout::{ClientFilter, SampleClient, SampleSource};
pub use timetag::TimetagAdjuster;

pub use daq_pool;
