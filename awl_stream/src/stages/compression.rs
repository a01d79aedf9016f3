//! IMA-ADPCM compression / decompression stage.
//!
//! Compresses 16-bit audio extracted from the configured sample format into
//! 4-bit codes, two per byte. Every packet starts with the serialized
//! predictor state (one per channel) so a receiver resynchronizes from any
//! packet boundary:
//!
//! ```text
//! stereo: [state_left][state_right][(L & 0x0F) | (R << 4), ...]
//! mono:   [state][(s0 & 0x0F) | (s1 << 4), ...][trailing nibble if odd]
//! ```
//!
//! The discard path runs the encoder without emitting output, keeping its
//! prediction history warm while the fallback gate routes packets through
//! the other branch of the chain.

use awl_dsp::adpcm::{self, AdpcmState};

use crate::error::{Error, Result};
use crate::format::{BYTE_SIZE_BITS, SampleEncoding, SampleFormat, WORD_SIZE_BITS};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Serialized predictor state bytes per channel.
const STATE_SIZE: usize = AdpcmState::WIRE_SIZE;

/// Compression direction and channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// Compress interleaved stereo.
    PackStereo,
    /// Decompress interleaved stereo.
    UnpackStereo,
    /// Compress mono.
    PackMono,
    /// Decompress mono.
    UnpackMono,
}

/// IMA-ADPCM stage.
pub struct CompressionStage {
    /// Compression direction and channel layout.
    pub mode: CompressionMode,
    /// Format of the uncompressed samples.
    pub sample_format: SampleFormat,
    left_state: AdpcmState,
    right_state: AdpcmState,
    sample_size_bits: u16,
    sample_size_bytes: u16,
    bit_shift_16bits: u32,
    extend_bits: u16,
}

impl CompressionStage {
    /// Create a compression stage.
    pub fn new(mode: CompressionMode, sample_format: SampleFormat) -> Self {
        Self {
            mode,
            sample_format,
            left_state: AdpcmState::new(),
            right_state: AdpcmState::new(),
            sample_size_bits: 0,
            sample_size_bytes: 0,
            bit_shift_16bits: 0,
            extend_bits: 0,
        }
    }

    pub(crate) fn init(&mut self, _ctx: &mut StageInitCtx<'_>) -> Result<()> {
        if self.sample_format.sample_encoding == SampleEncoding::Packed
            && self.sample_format.bit_depth.bits() % BYTE_SIZE_BITS != 0
        {
            // Packed samples not aligned to bytes are not supported.
            return Err(Error::ProcessingStageInit);
        }

        self.left_state = AdpcmState::new();
        self.right_state = AdpcmState::new();
        self.bit_shift_16bits = u32::from(self.sample_format.bit_depth.bits() - 16);
        self.sample_size_bits = match self.sample_format.sample_encoding {
            SampleEncoding::Unpacked => WORD_SIZE_BITS,
            SampleEncoding::Packed => self.sample_format.bit_depth.bits(),
        };
        self.sample_size_bytes = self.sample_size_bits / BYTE_SIZE_BITS;
        self.extend_bits = match self.mode {
            CompressionMode::UnpackStereo | CompressionMode::UnpackMono => {
                self.sample_size_bits - self.sample_format.bit_depth.bits()
            }
            _ => 0,
        };

        Ok(())
    }

    pub(crate) fn ctrl(&mut self, _cmd: u8, _arg: u32) -> Result<u32> {
        Ok(0)
    }

    pub(crate) fn process(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        Ok(match self.mode {
            CompressionMode::PackStereo => self.pack_stereo(input, output),
            CompressionMode::UnpackStereo => self.unpack_stereo(input, output),
            CompressionMode::PackMono => self.pack_mono(input, output),
            CompressionMode::UnpackMono => self.unpack_mono(input, output),
        })
    }

    pub(crate) fn process_discard(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        match self.mode {
            CompressionMode::PackStereo => {
                self.pack_stereo(input, output);
            }
            CompressionMode::PackMono => {
                self.pack_mono(input, output);
            }
            CompressionMode::UnpackStereo | CompressionMode::UnpackMono => {}
        }
        Ok(0)
    }

    /// Encoder predictor states, for diagnostics.
    pub fn states(&self) -> (AdpcmState, AdpcmState) {
        (self.left_state, self.right_state)
    }

    fn read_sample16(&self, input: &[u8], offset: usize) -> i32 {
        let size = self.sample_size_bytes as usize;
        let mut raw = 0u32;
        for (i, &b) in input[offset..offset + size].iter().enumerate() {
            raw |= u32::from(b) << (8 * i);
        }
        i32::from(((raw >> self.bit_shift_16bits) & 0xFFFF) as u16 as i16)
    }

    fn write_sample16(&self, output: &mut [u8], offset: usize, decoded: i16) {
        let mut value = (i32::from(decoded) as u32) << self.bit_shift_16bits;
        if self.extend_bits > 0 {
            let depth = u32::from(self.sample_format.bit_depth.bits());
            value = if value & (1 << (depth - 1)) != 0 {
                value | (u32::MAX << depth)
            } else {
                value & ((1 << depth) - 1)
            };
        }
        let size = self.sample_size_bytes as usize;
        output[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
    }

    fn pack_stereo(&mut self, input: &[u8], output: &mut [u8]) -> u16 {
        let sample_size = self.sample_size_bytes as usize;
        let frame_count = input.len() / (2 * sample_size);

        output[..STATE_SIZE].copy_from_slice(&self.left_state.to_bytes());
        output[STATE_SIZE..2 * STATE_SIZE].copy_from_slice(&self.right_state.to_bytes());

        let mut in_idx = 0usize;
        for i in 0..frame_count {
            let left_sample = self.read_sample16(input, in_idx);
            let left = adpcm::encode(&mut self.left_state, left_sample);
            in_idx += sample_size;
            let right_sample = self.read_sample16(input, in_idx);
            let right = adpcm::encode(&mut self.right_state, right_sample);
            in_idx += sample_size;
            output[2 * STATE_SIZE + i] = (left & 0x0F) | (right << 4);
        }

        (frame_count + 2 * STATE_SIZE) as u16
    }

    fn unpack_stereo(&mut self, input: &[u8], output: &mut [u8]) -> u16 {
        let sample_size = self.sample_size_bytes as usize;

        self.left_state = AdpcmState::from_bytes([input[0], input[1], input[2]]);
        self.right_state =
            AdpcmState::from_bytes([input[3], input[4], input[5]]);

        let frame_count = input.len() - 2 * STATE_SIZE;
        let mut out_idx = 0usize;
        for &byte in &input[2 * STATE_SIZE..2 * STATE_SIZE + frame_count] {
            let left = adpcm::decode(&mut self.left_state, byte & 0x0F);
            self.write_sample16(output, out_idx, left);
            out_idx += sample_size;
            let right = adpcm::decode(&mut self.right_state, byte >> 4);
            self.write_sample16(output, out_idx, right);
            out_idx += sample_size;
        }

        (frame_count * 2 * sample_size) as u16
    }

    fn pack_mono(&mut self, input: &[u8], output: &mut [u8]) -> u16 {
        let sample_size = self.sample_size_bytes as usize;
        let sample_count = input.len() / sample_size;
        let pair_count = sample_count / 2;

        output[..STATE_SIZE].copy_from_slice(&self.left_state.to_bytes());

        let mut in_idx = 0usize;
        for i in 0..pair_count {
            let low_sample = self.read_sample16(input, in_idx);
            let low = adpcm::encode(&mut self.left_state, low_sample);
            in_idx += sample_size;
            let high_sample = self.read_sample16(input, in_idx);
            let high = adpcm::encode(&mut self.left_state, high_sample);
            in_idx += sample_size;
            output[STATE_SIZE + i] = (low & 0x0F) | (high << 4);
        }
        if sample_count % 2 != 0 {
            let last_sample = self.read_sample16(input, in_idx);
            let last = adpcm::encode(&mut self.left_state, last_sample);
            output[STATE_SIZE + pair_count] = last & 0x0F;
        }

        (pair_count + sample_count % 2 + STATE_SIZE) as u16
    }

    fn unpack_mono(&mut self, input: &[u8], output: &mut [u8]) -> u16 {
        let sample_size = self.sample_size_bytes as usize;

        self.left_state = AdpcmState::from_bytes([input[0], input[1], input[2]]);

        let sample_count = (input.len() - STATE_SIZE) * 2;
        let mut out_idx = 0usize;
        for &byte in &input[STATE_SIZE..] {
            let first = adpcm::decode(&mut self.left_state, byte & 0x0F);
            self.write_sample16(output, out_idx, first);
            out_idx += sample_size;
            let second = adpcm::decode(&mut self.left_state, byte >> 4);
            self.write_sample16(output, out_idx, second);
            out_idx += sample_size;
        }

        (sample_count * sample_size) as u16
    }
}
