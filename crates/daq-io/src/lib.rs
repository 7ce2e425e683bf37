//! Byte-stream acquisition for DAQ sensors.
//!
//! # Architecture
//!
//! ```text
//! Channel ──► IoStream ──► Scanner ──► Decoder ──► TimetagAdjuster ──► SampleSource
//! (tcp/udp/    (buffer,     (framing,    (bytes →     (optional)          (fan-out)
//!  serial/      stamps)      resync)      samples)
//!  mock)
//! ```
//!
//! A [`SensorReader`] owns one such chain; an [`AcquisitionThread`] runs it.
//! Everything between the channel and the fan-out is single-threaded.

pub mod acquisition;
pub mod channels;
pub mod iostream;
pub mod reader;
pub mod scanner;

pub use acquisition::{AcquisitionThread, ReaderExit};
pub use iostream::{IoStats, IoStream, IoStreamConfig};
pub use reader::{ReadOutcome, ReaderStats, ReaderStatsSnapshot, SensorReader};
pub use scanner::{Framing, LengthField, Scanner};
