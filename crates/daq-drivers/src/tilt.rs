//! Two-axis tilt sensor.
//!
//! Binary frame, 6 bytes:
//!
//! ```text
//! 0xff | pitch_hi pitch_lo | roll_hi roll_lo | checksum
//! ```
//!
//! Angles are big-endian `i16` scaled so that full scale is ±90°. The
//! checksum is the low byte of the sum of bytes 1..=4. The sensor is
//! mounted upside down, so both axes are negated unless configured
//! otherwise.

use daq_core::decoder::{Decoder, DecoderContext, RawMessage};
use daq_core::error::{AppResult, FrameError};
use daq_pool::{SampleId, SampleMut, SamplePool, SampleType};
use serde::Deserialize;
use tracing::debug;

/// Frame start byte.
pub const TILT_HEADER: u8 = 0xff;
/// Frame length including header and checksum.
pub const TILT_FRAME_LEN: usize = 6;

const DEGREES_PER_COUNT: f64 = 90.0 / 32768.0;

/// Options of the `tilt` class.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TiltOptions {
    /// Negate both axes (sensor mounted inverted).
    #[serde(default = "default_inverted")]
    pub inverted: bool,
}

fn default_inverted() -> bool {
    true
}

impl Default for TiltOptions {
    fn default() -> Self {
        Self {
            inverted: default_inverted(),
        }
    }
}

/// Decodes tilt frames into `[pitch, roll]` degrees.
#[derive(Debug, Clone)]
pub struct TiltDecoder {
    id: SampleId,
    sign: f64,
}

impl TiltDecoder {
    /// Decoder stamping samples with `id`.
    #[must_use]
    pub fn new(id: SampleId, options: &TiltOptions) -> Self {
        Self {
            id,
            sign: if options.inverted { -1.0 } else { 1.0 },
        }
    }

    /// Decoder for a registered sensor.
    pub fn from_context(ctx: &DecoderContext) -> AppResult<Self> {
        let options: TiltOptions = ctx.options()?;
        debug!(sensor = %ctx.sensor, id = %ctx.id, inverted = options.inverted, "Tilt decoder");
        Ok(Self::new(ctx.id, &options))
    }

    /// Checksum over the four angle bytes.
    #[must_use]
    pub fn checksum(frame: &[u8]) -> u8 {
        frame[1..5].iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    fn angle(&self, hi: u8, lo: u8) -> f32 {
        let counts = i16::from_be_bytes([hi, lo]);
        (self.sign * f64::from(counts) * DEGREES_PER_COUNT) as f32
    }
}

impl Decoder for TiltDecoder {
    fn decode(
        &mut self,
        message: &RawMessage,
        pool: &SamplePool,
        out: &mut Vec<SampleMut>,
    ) -> Result<(), FrameError> {
        let frame = &message.data[..];
        if frame.len() < TILT_FRAME_LEN {
            return Err(FrameError::Incomplete { length: frame.len() });
        }
        if frame.len() > TILT_FRAME_LEN || frame[0] != TILT_HEADER {
            return Err(FrameError::Malformed(format!(
                "expected {TILT_FRAME_LEN}-byte frame starting 0x{TILT_HEADER:02x}"
            )));
        }
        let computed = Self::checksum(frame);
        if computed != frame[5] {
            return Err(FrameError::BadChecksum {
                expected: u32::from(frame[5]),
                computed: u32::from(computed),
            });
        }

        let mut sample = pool.acquire(SampleType::Float, 2)?;
        sample.copy_from(&[self.angle(frame[1], frame[2]), self.angle(frame[3], frame[4])])?;
        sample.set_id(self.id);
        sample.set_timetag(message.timetag);
        out.push(sample);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn decode(decoder: &mut TiltDecoder, frame: &'static [u8]) -> Result<Vec<SampleMut>, FrameError> {
        let pool = SamplePool::default();
        let mut out = Vec::new();
        let message = RawMessage {
            timetag: 42,
            data: Bytes::from_static(frame),
        };
        decoder.decode(&message, &pool, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_decode_inverted_mount() {
        let mut decoder = TiltDecoder::new(SampleId::new(2, 5), &TiltOptions::default());
        let out = decode(&mut decoder, b"\xff\x01\xbb\xff\x2e\xe9").unwrap();
        let values = out[0].data::<f32>().unwrap();
        assert!((values[0] - -1.217).abs() < 0.01, "pitch {}", values[0]);
        assert!((values[1] - 0.577).abs() < 0.01, "roll {}", values[1]);
        assert_eq!(out[0].timetag(), 42);
        assert_eq!(out[0].id(), SampleId::new(2, 5));
    }

    #[test]
    fn test_upright_mount_keeps_sign() {
        let mut decoder = TiltDecoder::new(SampleId::default(), &TiltOptions { inverted: false });
        let out = decode(&mut decoder, b"\xff\x01\xbb\xff\x2e\xe9").unwrap();
        assert!(out[0].data::<f32>().unwrap()[0] > 1.2);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut decoder = TiltDecoder::new(SampleId::default(), &TiltOptions::default());
        assert_eq!(
            decode(&mut decoder, b"\xff\x01\xbb\xff\x2e\x00").unwrap_err(),
            FrameError::BadChecksum { expected: 0, computed: 0xe9 }
        );
        assert!(matches!(
            decode(&mut decoder, b"\xff\x01\xbb"),
            Err(FrameError::Incomplete { length: 3 })
        ));
        assert!(matches!(
            decode(&mut decoder, b"\xfe\x01\xbb\xff\x2e\xe9"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_options_from_context() {
        let ctx = DecoderContext::new("tilt", SampleId::default())
            .with_options(toml::from_str("inverted = false").unwrap());
        let decoder = TiltDecoder::from_context(&ctx).unwrap();
        assert_eq!(decoder.sign, 1.0);

        let bad = DecoderContext::new("tilt", SampleId::default())
            .with_options(toml::from_str("flipped = true").unwrap());
        assert!(TiltDecoder::from_context(&bad).is_err());
    }
}
