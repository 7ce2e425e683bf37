//! Text records of numbers, e.g. `"$WIND,3.25,-0.5,12\r\n"`.

use daq_core::decoder::{Decoder, DecoderContext, RawMessage};
use daq_core::error::{AppResult, DaqError, FrameError};
use daq_pool::{SampleId, SampleMut, SamplePool, SampleType};
use serde::Deserialize;
use tracing::debug;

/// Options of the `ascii` class.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsciiOptions {
    /// Leading text every record must start with; stripped before parsing.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Exact number of values per record, when known.
    #[serde(default)]
    pub values: Option<usize>,
}

/// Parses whitespace- or comma-separated numbers into a `Float` sample.
#[derive(Debug, Clone)]
pub struct AsciiDecoder {
    id: SampleId,
    options: AsciiOptions,
    values: Vec<f32>,
}

impl AsciiDecoder {
    /// Fails when `values` is zero.
    pub fn new(id: SampleId, options: AsciiOptions) -> AppResult<Self> {
        if options.values == Some(0) {
            return Err(DaqError::Configuration("ascii decoder: values must be positive".into()));
        }
        Ok(Self {
            id,
            options,
            values: Vec::new(),
        })
    }

    /// Decoder for a registered sensor.
    pub fn from_context(ctx: &DecoderContext) -> AppResult<Self> {
        let options: AsciiOptions = ctx.options()?;
        debug!(
            sensor = %ctx.sensor,
            id = %ctx.id,
            prefix = ?options.prefix,
            values = ?options.values,
            "ASCII decoder"
        );
        Self::new(ctx.id, options)
    }

    fn parse(&mut self, record: &[u8]) -> Result<(), FrameError> {
        let text = std::str::from_utf8(record)
            .map_err(|_| FrameError::Malformed("record is not UTF-8".into()))?;
        let mut text = text.trim_end_matches(&['\r', '\n', '\0'][..]);
        if let Some(prefix) = &self.options.prefix {
            text = text
                .strip_prefix(prefix.as_str())
                .ok_or_else(|| FrameError::Malformed(format!("record does not start with '{prefix}'")))?;
        }

        self.values.clear();
        for field in text.split(|c: char| c == ',' || c.is_whitespace()) {
            if field.is_empty() {
                continue;
            }
            let value = field
                .parse::<f32>()
                .map_err(|_| FrameError::Malformed(format!("'{field}' is not a number")))?;
            self.values.push(value);
        }

        if self.values.is_empty() {
            return Err(FrameError::Malformed("no values in record".into()));
        }
        match self.options.values {
            Some(n) if n != self.values.len() => Err(FrameError::Malformed(format!(
                "expected {n} values, found {}",
                self.values.len()
            ))),
            _ => Ok(()),
        }
    }
}

impl Decoder for AsciiDecoder {
    fn decode(
        &mut self,
        message: &RawMessage,
        pool: &SamplePool,
        out: &mut Vec<SampleMut>,
    ) -> Result<(), FrameError> {
        self.parse(&message.data)?;
        let mut sample = pool.acquire(SampleType::Float, self.values.len())?;
        sample.copy_from(&self.values[..])?;
        sample.set_id(self.id);
        sample.set_timetag(message.timetag);
        out.push(sample);
        Ok(())
    }
}
