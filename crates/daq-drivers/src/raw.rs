//! Pass-through decoder: one `UChar` sample per message.

use daq_core::decoder::{Decoder, RawMessage};
use daq_core::error::FrameError;
use daq_pool::{SampleId, SampleMut, SamplePool, SampleType};

/// Copies message bytes into a `UChar` sample.
#[derive(Debug, Clone, Copy)]
pub struct RawDecoder {
    id: SampleId,
}

impl RawDecoder {
    /// Decoder stamping samples with `id`.
    #[must_use]
    pub fn new(id: SampleId) -> Self {
        Self { id }
    }
}

impl Decoder for RawDecoder {
    fn decode(
        &mut self,
        message: &RawMessage,
        pool: &SamplePool,
        out: &mut Vec<SampleMut>,
    ) -> Result<(), FrameError> {
        let mut sample = pool.acquire(SampleType::UChar, message.data.len())?;
        sample.copy_from(&message.data[..])?;
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

    #[test]
    fn test_copies_bytes() {
        let pool = SamplePool::default();
        let mut out = Vec::new();
        let message = RawMessage {
            timetag: 99,
            data: Bytes::from_static(b"\x00\x01\x02"),
        };
        RawDecoder::new(SampleId::new(3, 3))
            .decode(&message, &pool, &mut out)
            .unwrap();
        let sample = out.pop().unwrap().freeze();
        assert_eq!(sample.data::<u8>(), Some(&[0u8, 1, 2][..]));
        assert_eq!(sample.timetag(), 99);
        assert_eq!(sample.id(), SampleId::new(3, 3));
    }
}
