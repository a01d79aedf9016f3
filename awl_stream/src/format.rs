//! Audio sample formats.

use crate::error::{Error, Result};

/// Maximum number of audio channels supported by the core.
pub const MAX_CHANNEL_COUNT: u8 = 2;

/// Bytes per CPU-word-aligned audio sample.
pub const WORD_SIZE_BYTES: u16 = 4;

/// Bits per CPU-word-aligned audio sample.
pub const WORD_SIZE_BITS: u16 = WORD_SIZE_BYTES * BYTE_SIZE_BITS;

/// Bits per byte.
pub const BYTE_SIZE_BITS: u16 = 8;

/// Bit resolution of an audio sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum BitDepth {
    /// 16-bit PCM samples.
    Bits16 = 16,
    /// 18-bit PCM samples.
    Bits18 = 18,
    /// 20-bit PCM samples.
    Bits20 = 20,
    /// 24-bit PCM samples.
    Bits24 = 24,
    /// 32-bit PCM samples.
    Bits32 = 32,
}

impl BitDepth {
    /// Valid bits per sample.
    #[inline]
    pub const fn bits(self) -> u16 {
        self as u16
    }
}

/// How samples are laid out in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SampleEncoding {
    /// Samples right-aligned in [`WORD_SIZE_BITS`]-bit words.
    Unpacked,
    /// Samples stored with exactly `bit_depth` bits.
    Packed,
}

/// Audio sample format: bit depth plus encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SampleFormat {
    /// Bit resolution of a sample.
    pub bit_depth: BitDepth,
    /// Sample encoding attribute.
    pub sample_encoding: SampleEncoding,
}

impl SampleFormat {
    /// Bits used to store one sample in a payload.
    #[inline]
    pub const fn sample_size_bits(&self) -> u16 {
        match self.sample_encoding {
            SampleEncoding::Unpacked => WORD_SIZE_BITS,
            SampleEncoding::Packed => self.bit_depth.bits(),
        }
    }

    /// Bytes used to store one sample in a payload.
    ///
    /// Packed formats whose bit depth is not byte aligned have no byte
    /// width; stages that need one reject such formats at init.
    pub fn sample_size_bytes(&self) -> Result<u16> {
        let bits = self.sample_size_bits();
        if bits % BYTE_SIZE_BITS != 0 {
            return Err(Error::ProcessingStageInit);
        }
        Ok(bits / BYTE_SIZE_BITS)
    }
}

/// Number of audio packets spanning `ms` milliseconds of audio.
///
/// Rounds down. Used to derive packet counts from durations, e.g. the mute
/// stage's reload value for ~30 ms of silence after an underflow.
pub fn packets_in_ms(
    ms: u16,
    audio_payload_size: u16,
    channel_count: u8,
    sample_format: SampleFormat,
    sampling_rate: u32,
) -> u16 {
    let sample_count = (audio_payload_size * BYTE_SIZE_BITS) / sample_format.sample_size_bits();
    let samples_per_channel = sample_count / u16::from(channel_count);
    ((f32::from(ms) / 1000.0) / (f32::from(samples_per_channel) / sampling_rate as f32)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_sizes() {
        let unpacked = SampleFormat {
            bit_depth: BitDepth::Bits20,
            sample_encoding: SampleEncoding::Unpacked,
        };
        assert_eq!(unpacked.sample_size_bits(), 32);
        assert_eq!(unpacked.sample_size_bytes().unwrap(), 4);

        let packed = SampleFormat {
            bit_depth: BitDepth::Bits24,
            sample_encoding: SampleEncoding::Packed,
        };
        assert_eq!(packed.sample_size_bits(), 24);
        assert_eq!(packed.sample_size_bytes().unwrap(), 3);

        let ragged = SampleFormat {
            bit_depth: BitDepth::Bits18,
            sample_encoding: SampleEncoding::Packed,
        };
        assert!(ragged.sample_size_bytes().is_err());
    }

    #[test]
    fn test_packets_in_ms() {
        let fmt = SampleFormat {
            bit_depth: BitDepth::Bits16,
            sample_encoding: SampleEncoding::Packed,
        };
        // 60 mono 16-bit samples per packet at 48 kHz -> 1.25 ms per packet.
        assert_eq!(packets_in_ms(30, 120, 1, fmt, 48_000), 24);
        // Stereo halves the duration per packet.
        assert_eq!(packets_in_ms(30, 120, 2, fmt, 48_000), 48);
    }
}
