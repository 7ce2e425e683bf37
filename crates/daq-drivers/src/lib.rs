//! Built-in sensor decoders.
//!
//! | Class   | Decoder          | Output                                   |
//! |---------|------------------|------------------------------------------|
//! | `tilt`  | [`TiltDecoder`]  | `Float` `[pitch, roll]` in degrees       |
//! | `ascii` | [`AsciiDecoder`] | `Float` values parsed from a text record |
//! | `raw`   | [`RawDecoder`]   | `UChar` copy of the message bytes        |
//!
//! Call [`register_builtin`] once at startup to make them available to
//! sensor configurations by class name.

mod ascii;
mod raw;
mod tilt;

pub use ascii::{AsciiDecoder, AsciiOptions};
pub use raw::RawDecoder;
pub use tilt::{TiltDecoder, TiltOptions, TILT_FRAME_LEN, TILT_HEADER};

use daq_core::decoder::{Decoder, DecoderRegistry};
use daq_core::error::AppResult;

/// Install the built-in decoders under `"tilt"`, `"ascii"` and `"raw"`.
pub fn register_builtin(registry: &mut DecoderRegistry) -> AppResult<()> {
    registry.register("tilt", |ctx| {
        Ok(Box::new(TiltDecoder::from_context(ctx)?) as Box<dyn Decoder>)
    })?;
    registry.register("ascii", |ctx| {
        Ok(Box::new(AsciiDecoder::from_context(ctx)?) as Box<dyn Decoder>)
    })?;
    registry.register("raw", |ctx| Ok(Box::new(RawDecoder::new(ctx.id)) as Box<dyn Decoder>))?;
    Ok(())
}
