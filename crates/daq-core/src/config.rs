//! Acquisition configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed `DAQ_`, nested keys separated by `__`
//!    (e.g. `DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use daq_core::config::AcquisitionConfig;
//!
//! let config = AcquisitionConfig::load_from("config/acquire.toml")?;
//! for sensor in &config.sensors {
//!     println!("{} ({})", sensor.name, sensor.class);
//! }
//! # Ok::<(), daq_core::error::DaqError>(())
//! ```
//!
//! A sensor block looks like:
//!
//! ```toml
//! [[sensors]]
//! name = "tilt"
//! class = "tilt"
//! dsm_id = 1
//! sensor_id = 40
//! nominal_rate = 20.0
//! latency_correction = true
//!
//! [sensors.channel]
//! type = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//!
//! [sensors.framing]
//! message_length = 6
//! separator = "\\xff"
//! separator_at_end = false
//! ```

use std::collections::HashSet;
use std::path::Path;

use daq_pool::{PoolConfig, SampleId};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Top-level acquisition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// `[application]` section.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[pool]` section.
    #[serde(default)]
    pub pool: PoolSettings,
    /// `[[sensors]]` entries, one reader each.
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in log records.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per line
    Json,
}

/// Sample pool tuning.
///
/// Defaults are tuned heuristics, not derived bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Largest sample, in elements, served by the small class.
    #[serde(default = "default_small_max")]
    pub small_max_elements: usize,
    /// Largest sample, in elements, served by the medium class.
    #[serde(default = "default_medium_max")]
    pub medium_max_elements: usize,
    /// Byte budget used to pre-size the free lists.
    #[serde(default = "default_initial_bytes")]
    pub initial_bytes: usize,
    /// Free buffers kept per class; returns beyond this are deleted.
    #[serde(default)]
    pub max_free_per_class: Option<usize>,
    /// Spares a larger class must hold before lending to a smaller one.
    #[serde(default = "default_borrow_min_spares")]
    pub borrow_min_spares: usize,
    /// Largest sample, in elements.
    #[serde(default = "default_max_sample_length")]
    pub max_sample_length: usize,
    /// Poison unused buffer tails; defaults to on in debug builds.
    #[serde(default)]
    pub poison: Option<bool>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            small_max_elements: default_small_max(),
            medium_max_elements: default_medium_max(),
            initial_bytes: default_initial_bytes(),
            max_free_per_class: None,
            borrow_min_spares: default_borrow_min_spares(),
            max_sample_length: default_max_sample_length(),
            poison: None,
        }
    }
}

impl PoolSettings {
    /// Pool configuration with these settings applied.
    #[must_use]
    pub fn to_pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            small_max_elements: self.small_max_elements,
            medium_max_elements: self.medium_max_elements,
            initial_bytes: self.initial_bytes,
            max_free_per_class: self.max_free_per_class,
            borrow_min_spares: self.borrow_min_spares,
            max_sample_length: self.max_sample_length,
            poison: self.poison.unwrap_or(defaults.poison),
        }
    }
}

/// One acquisition source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Unique name; also the reader thread's name.
    pub name: String,
    /// Decoder registry key.
    pub class: String,
    /// Data system id, the upper part of the sample id.
    #[serde(default)]
    pub dsm_id: u16,
    /// Sensor id within the data system.
    pub sensor_id: u16,
    /// Byte transport.
    pub channel: ChannelConfig,
    /// Message framing.
    #[serde(default)]
    pub framing: FramingConfig,
    /// Longer messages are dropped as oversize.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Back-date message time tags by their transmission time.
    #[serde(default)]
    pub latency_correction: bool,
    /// Nominal sample rate in Hz; enables time-tag adjustment.
    #[serde(default)]
    pub nominal_rate: Option<f64>,
    /// Time-tag re-anchor window, in seconds.
    #[serde(default = "default_adjust_period")]
    pub adjust_period_secs: f64,
    /// Byte stream buffering.
    #[serde(default)]
    pub io: IoConfig,
    /// Decoder-specific options.
    #[serde(default = "empty_table")]
    pub options: toml::Value,
}

impl SensorConfig {
    /// Id stamped on this sensor's samples.
    #[must_use]
    pub fn sample_id(&self) -> SampleId {
        SampleId::new(self.dsm_id, self.sensor_id)
    }
}

/// Channel backend, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// TCP client socket.
    Tcp {
        /// `host:port`
        address: String,
        /// Non-blocking reads; would-block reads return no data.
        #[serde(default)]
        nonblocking: bool,
        /// Connect timeout in milliseconds.
        #[serde(default = "default_connect_timeout")]
        connect_timeout_ms: u64,
    },
    /// UDP socket, one datagram per read.
    Udp {
        /// Local `host:port` to bind.
        bind: String,
        /// Optional peer to restrict datagrams to.
        #[serde(default)]
        connect: Option<String>,
    },
    /// Serial line.
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`.
        port: String,
        /// Line speed in bits per second.
        baud_rate: u32,
        /// Data bits per character (5 to 8).
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity bit.
        #[serde(default)]
        parity: Parity,
        /// Stop bits (1 or 2).
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        /// Blocking read bound in milliseconds.
        #[serde(default = "default_read_timeout")]
        read_timeout_ms: u64,
    },
    /// Replays a fixed byte string, for bench testing without hardware.
    Mock {
        /// Payload with backslash escapes.
        data: String,
        /// Pause before each delivery, in milliseconds.
        #[serde(default = "default_mock_interval")]
        interval_ms: u64,
        /// Replay the payload forever.
        #[serde(default)]
        repeat: bool,
    },
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl ChannelConfig {
    /// Bits on the wire per byte, for serial lines.
    #[must_use]
    pub fn bits_per_byte(&self) -> u32 {
        match self {
            ChannelConfig::Serial {
                data_bits,
                parity,
                stop_bits,
                ..
            } => {
                1 + u32::from(*data_bits)
                    + u32::from(*parity != Parity::None)
                    + u32::from(*stop_bits)
            }
            _ => 10,
        }
    }
}

/// How message boundaries are found in the byte stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Fixed record length in bytes (0 = variable).
    #[serde(default)]
    pub message_length: usize,
    /// Separator with backslash escapes, e.g. `"\r\n"` or `"\xff"`.
    #[serde(default)]
    pub separator: Option<String>,
    /// Separator terminates (true) or begins (false) each message.
    #[serde(default = "default_true")]
    pub separator_at_end: bool,
    /// Counted framing; takes precedence over the other fields.
    #[serde(default)]
    pub length_field: Option<LengthFieldConfig>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            message_length: 0,
            separator: None,
            separator_at_end: true,
            length_field: None,
        }
    }
}

/// Length prefix for counted framing.
///
/// Total message length is the field value plus `adjust`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthFieldConfig {
    /// Byte offset of the field from the message start.
    #[serde(default)]
    pub offset: usize,
    /// Field width: 1, 2 or 4 bytes.
    #[serde(default = "default_length_width")]
    pub width: u8,
    /// Most significant byte first.
    #[serde(default)]
    pub big_endian: bool,
    /// Added to the field value to give the total length.
    #[serde(default)]
    pub adjust: i64,
}

/// Byte stream buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Buffer capacity; defaults to twice the expected message size.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Longest a written byte may sit in the buffer.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Attempts made by a synchronous flush.
    #[serde(default = "default_flush_retries")]
    pub flush_retries: u32,
    /// Pause after a read that returned nothing.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_size: None,
            max_latency_ms: default_max_latency_ms(),
            flush_retries: default_flush_retries(),
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "daq-acquire".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_small_max() -> usize {
    64
}

fn default_medium_max() -> usize {
    512
}

fn default_initial_bytes() -> usize {
    1 << 20
}

fn default_borrow_min_spares() -> usize {
    2
}

fn default_max_sample_length() -> usize {
    4 << 20
}

fn default_max_message_length() -> usize {
    8192
}

fn default_adjust_period() -> f64 {
    10.0
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_read_timeout() -> u64 {
    100
}

fn default_mock_interval() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_length_width() -> u8 {
    1
}

fn default_max_latency_ms() -> u64 {
    250
}

fn default_flush_retries() -> u32 {
    10
}

fn default_idle_sleep_ms() -> u64 {
    5
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AcquisitionConfig {
    /// Load from a TOML file plus `DAQ_` environment overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text (no environment layer) and validate.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let pool = &self.pool;
        if pool.small_max_elements == 0 || pool.small_max_elements >= pool.medium_max_elements {
            return Err(invalid(format!(
                "pool: small_max_elements ({}) must be non-zero and below medium_max_elements ({})",
                pool.small_max_elements, pool.medium_max_elements
            )));
        }
        if pool.max_sample_length == 0 {
            return Err(invalid("pool: max_sample_length must be positive"));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if !names.insert(sensor.name.as_str()) {
                return Err(invalid(format!("Duplicate sensor name: {}", sensor.name)));
            }
            if !ids.insert(sensor.sample_id()) {
                return Err(invalid(format!(
                    "Duplicate sample id {} (sensor {})",
                    sensor.sample_id(),
                    sensor.name
                )));
            }
            sensor.validate()?;
        }
        Ok(())
    }
}

impl SensorConfig {
    fn validate(&self) -> AppResult<()> {
        let name = &self.name;
        if self.dsm_id > SampleId::MAX_DSM_ID {
            return Err(invalid(format!(
                "sensor '{name}': dsm_id {} exceeds {}",
                self.dsm_id,
                SampleId::MAX_DSM_ID
            )));
        }
        if let Some(rate) = self.nominal_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(invalid(format!(
                    "sensor '{name}': nominal_rate must be positive, got {rate}"
                )));
            }
        }
        if !self.adjust_period_secs.is_finite() || self.adjust_period_secs <= 0.0 {
            return Err(invalid(format!(
                "sensor '{name}': adjust_period_secs must be positive"
            )));
        }
        if self.max_message_length == 0 {
            return Err(invalid(format!(
                "sensor '{name}': max_message_length must be positive"
            )));
        }

        let framing = &self.framing;
        if framing.message_length > self.max_message_length {
            return Err(invalid(format!(
                "sensor '{name}': message_length {} exceeds max_message_length {}",
                framing.message_length, self.max_message_length
            )));
        }
        let separator = match &framing.separator {
            Some(text) => {
                let bytes = parse_separator(text)
                    .map_err(|e| invalid(format!("sensor '{name}': {e}")))?;
                if bytes.is_empty() {
                    return Err(invalid(format!("sensor '{name}': separator is empty")));
                }
                Some(bytes)
            }
            None => None,
        };
        if let Some(field) = &framing.length_field {
            if !matches!(field.width, 1 | 2 | 4) {
                return Err(invalid(format!(
                    "sensor '{name}': length_field width must be 1, 2 or 4, got {}",
                    field.width
                )));
            }
        } else if framing.message_length == 0 && separator.is_none() {
            return Err(invalid(format!(
                "sensor '{name}': framing needs message_length, separator or length_field"
            )));
        }
        if let Some(sep) = &separator {
            if !framing.separator_at_end
                && framing.message_length > 0
                && framing.message_length < sep.len()
            {
                return Err(invalid(format!(
                    "sensor '{name}': message_length shorter than its separator"
                )));
            }
            if framing.separator_at_end && framing.message_length >= self.max_message_length {
                return Err(invalid(format!(
                    "sensor '{name}': minimum message_length {} leaves no room for the separator within max_message_length {}",
                    framing.message_length, self.max_message_length
                )));
            }
        }

        if let ChannelConfig::Serial { baud_rate: 0, .. } = self.channel {
            return Err(invalid(format!("sensor '{name}': baud_rate must be positive")));
        }
        if let ChannelConfig::Mock { data, .. } = &self.channel {
            parse_separator(data).map_err(|e| invalid(format!("sensor '{name}': {e}")))?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::Configuration(message.into())
}

/// Decode backslash escapes in a separator string.
///
/// Supports `\n`, `\r`, `\t`, `\\`, `\0` and `\xHH`; other characters are
/// taken as their UTF-8 bytes.
pub fn parse_separator(text: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some('0') => out.push(0),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = (hex.len() == 2)
                    .then(|| u8::from_str_radix(&hex, 16).ok())
                    .flatten()
                    .ok_or_else(|| format!("invalid \\x escape in '{text}'"))?;
                out.push(byte);
            }
            Some(other) => return Err(format!("unknown escape '\\{other}' in '{text}'")),
            None => return Err(format!("trailing backslash in '{text}'")),
        }
    }
    Ok(out)
}
