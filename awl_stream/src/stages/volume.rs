//! Digital volume stage.
//!
//! Multiplies every sample by a scalar factor in `[0, 1]`. Control commands
//! move a target threshold in 0.1 steps; the applied factor slews toward
//! the threshold by a small gradient per processed packet to avoid zipper
//! noise. Packed 16-bit payloads take an `i16` fast path; every other
//! format multiplies 32-bit container words.

use crate::error::{Error, Result};
use crate::format::{BitDepth, SampleEncoding, SampleFormat};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Maximum volume factor.
pub const VOLUME_MAX: f32 = 1.0;
/// Minimum volume factor.
pub const VOLUME_MIN: f32 = 0.0;
/// Per-packet slew toward the threshold.
pub const VOLUME_GRAD: f32 = 0.0003;
/// Threshold step for increase/decrease commands.
pub const VOLUME_TICK: f32 = 0.1;

/// Volume stage control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeCmd {
    /// Raise the threshold by one tick.
    Increase = 0,
    /// Lower the threshold by one tick.
    Decrease = 1,
    /// Drop factor and threshold to zero immediately.
    Mute = 2,
    /// Get the current factor scaled by 10 000.
    GetFactor = 3,
}

/// Ramped scalar gain stage.
pub struct VolumeStage {
    /// Format of the processed samples.
    pub sample_format: SampleFormat,
    /// Initial volume level in percent, 0..=100.
    pub initial_volume_level: u8,
    volume_factor: f32,
    volume_threshold: f32,
}

impl VolumeStage {
    /// Create a volume stage starting at `initial_volume_level` percent.
    pub fn new(sample_format: SampleFormat, initial_volume_level: u8) -> Self {
        Self {
            sample_format,
            initial_volume_level,
            volume_factor: 0.0,
            volume_threshold: 0.0,
        }
    }

    pub(crate) fn init(&mut self, _ctx: &mut StageInitCtx<'_>) -> Result<()> {
        if self.sample_format.bit_depth != BitDepth::Bits16
            && self.sample_format.sample_encoding != SampleEncoding::Unpacked
        {
            // Only 16-bit payloads may be packed.
            return Err(Error::ProcessingStageInit);
        }
        if f32::from(self.initial_volume_level) > VOLUME_MAX * 100.0 {
            return Err(Error::ProcessingStageInit);
        }

        self.volume_factor = f32::from(self.initial_volume_level) / 100.0;
        self.volume_threshold = self.volume_factor;
        Ok(())
    }

    pub(crate) fn ctrl(&mut self, cmd: u8, _arg: u32) -> Result<u32> {
        match cmd {
            c if c == VolumeCmd::Increase as u8 => {
                self.volume_threshold = (self.volume_threshold + VOLUME_TICK).min(VOLUME_MAX);
                Ok(0)
            }
            c if c == VolumeCmd::Decrease as u8 => {
                self.volume_threshold = (self.volume_threshold - VOLUME_TICK).max(VOLUME_MIN);
                Ok(0)
            }
            c if c == VolumeCmd::Mute as u8 => {
                self.volume_factor = 0.0;
                self.volume_threshold = 0.0;
                Ok(0)
            }
            c if c == VolumeCmd::GetFactor as u8 => Ok((self.volume_factor * 10_000.0) as u32),
            _ => Err(Error::InvalidCmd),
        }
    }

    pub(crate) fn process(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        if self.volume_threshold == VOLUME_MAX && self.volume_factor == VOLUME_MAX {
            // Unity gain: leave the packet untouched.
            return Ok(0);
        }

        self.adjust_volume_factor();

        let is_packed_16 = self.sample_format.bit_depth == BitDepth::Bits16
            && self.sample_format.sample_encoding == SampleEncoding::Packed;
        if is_packed_16 {
            apply_factor_16bits(input, output, self.volume_factor);
        } else {
            apply_factor_32bits(input, output, self.volume_factor);
        }

        Ok(input.len() as u16)
    }

    /// Current volume factor.
    #[inline]
    pub fn factor(&self) -> f32 {
        self.volume_factor
    }

    fn adjust_volume_factor(&mut self) {
        if self.volume_factor < self.volume_threshold {
            self.volume_factor = (self.volume_factor + VOLUME_GRAD).min(self.volume_threshold);
        } else if self.volume_factor > self.volume_threshold {
            self.volume_factor = (self.volume_factor - VOLUME_GRAD).max(self.volume_threshold);
        }
    }
}

fn apply_factor_16bits(input: &[u8], output: &mut [u8], factor: f32) {
    for (i, o) in input.chunks_exact(2).zip(output.chunks_exact_mut(2)) {
        let sample = i16::from_le_bytes([i[0], i[1]]);
        let scaled = (f32::from(sample) * factor) as i16;
        o.copy_from_slice(&scaled.to_le_bytes());
    }
}

fn apply_factor_32bits(input: &[u8], output: &mut [u8], factor: f32) {
    for (i, o) in input.chunks_exact(4).zip(output.chunks_exact_mut(4)) {
        let sample = i32::from_le_bytes([i[0], i[1], i[2], i[3]]);
        let scaled = (sample as f32 * factor) as i32;
        o.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCfg;
    use crate::stats::PipelineStats;
    use alloc::vec;

    fn fmt(bit_depth: BitDepth, sample_encoding: SampleEncoding) -> SampleFormat {
        SampleFormat {
            bit_depth,
            sample_encoding,
        }
    }

    fn init_stage(format: SampleFormat, level: u8) -> VolumeStage {
        let mut stage = VolumeStage::new(format, level);
        let mut pool = awl_core::MemPool::new(64);
        let mut extra = 0u8;
        let mut ctx = StageInitCtx {
            consumer_cfg: EndpointCfg {
                use_encapsulation: false,
                delayed_action: false,
                channel_count: 1,
                audio_payload_size: 0,
                queue_size: 1,
            },
            mem_pool: &mut pool,
            extra_queue_size: &mut extra,
            consumer_underflow_count: 0,
        };
        stage.init(&mut ctx).unwrap();
        stage
    }

    fn process_once(stage: &mut VolumeStage, input: &[u8], output: &mut [u8]) -> u16 {
        let mut stats = PipelineStats::default();
        let mut fallback = false;
        let mut ctx = StageCtx {
            consumer_cfg: EndpointCfg {
                use_encapsulation: false,
                delayed_action: false,
                channel_count: 1,
                audio_payload_size: 0,
                queue_size: 1,
            },
            consumer_queue_len: 0,
            consumer_queue_limit: 1,
            consumer_buffering_complete: true,
            samples_buffered_size: 0,
            stats: &mut stats,
            fallback_active: &mut fallback,
        };
        let mut header = AudioHeader::default();
        stage.process(&mut ctx, &mut header, input, output).unwrap()
    }

    #[test]
    fn test_unity_gain_passthrough() {
        let mut stage = init_stage(fmt(BitDepth::Bits16, SampleEncoding::Packed), 100);
        let input = vec![0x34u8; 8];
        let mut output = vec![0u8; 8];
        // Returns 0: nothing processed, packet used as-is.
        assert_eq!(process_once(&mut stage, &input, &mut output), 0);
    }

    #[test]
    fn test_half_volume_16bits() {
        let mut stage = init_stage(fmt(BitDepth::Bits16, SampleEncoding::Packed), 50);
        let input: alloc::vec::Vec<u8> =
            [1000i16, -1000, 32_000].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut output = vec![0u8; 6];
        assert_eq!(process_once(&mut stage, &input, &mut output), 6);

        let out: alloc::vec::Vec<i16> = output
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert!((i32::from(out[0]) - 500).abs() <= 1);
        assert!((i32::from(out[1]) + 500).abs() <= 1);
        assert!((i32::from(out[2]) - 16_000).abs() <= 16);
    }

    #[test]
    fn test_mute_zeroes_samples() {
        let mut stage = init_stage(fmt(BitDepth::Bits24, SampleEncoding::Unpacked), 80);
        stage.ctrl(VolumeCmd::Mute as u8, 0).unwrap();
        let input: alloc::vec::Vec<u8> =
            [400_000i32, -400_000].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut output = vec![0xFFu8; 8];
        assert_eq!(process_once(&mut stage, &input, &mut output), 8);
        assert!(output.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_slew_limit_per_packet() {
        // P5: |factor(t+1) - factor(t)| <= GRAD, and factor stays in [0,1].
        let mut stage = init_stage(fmt(BitDepth::Bits16, SampleEncoding::Packed), 0);
        stage.ctrl(VolumeCmd::Increase as u8, 0).unwrap();

        let input = vec![0u8; 4];
        let mut output = vec![0u8; 4];
        let mut previous = stage.factor();
        for _ in 0..500 {
            process_once(&mut stage, &input, &mut output);
            let current = stage.factor();
            assert!((current - previous).abs() <= VOLUME_GRAD + f32::EPSILON);
            assert!((VOLUME_MIN..=VOLUME_MAX).contains(&current));
            previous = current;
        }
        // 0.1 / 0.0003 ~ 334 packets to converge.
        assert!((stage.factor() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_clamped() {
        let mut stage = init_stage(fmt(BitDepth::Bits16, SampleEncoding::Packed), 100);
        for _ in 0..5 {
            stage.ctrl(VolumeCmd::Increase as u8, 0).unwrap();
        }
        assert_eq!(stage.ctrl(VolumeCmd::GetFactor as u8, 0).unwrap(), 10_000);

        for _ in 0..15 {
            stage.ctrl(VolumeCmd::Decrease as u8, 0).unwrap();
        }
        // Threshold bottomed out; factor slews down from 1.0.
        let input = vec![0u8; 4];
        let mut output = vec![0u8; 4];
        process_once(&mut stage, &input, &mut output);
        assert!(stage.factor() < 1.0);
    }

    #[test]
    fn test_packed_non16_rejected() {
        let mut stage = VolumeStage::new(fmt(BitDepth::Bits24, SampleEncoding::Packed), 50);
        let mut pool = awl_core::MemPool::new(64);
        let mut extra = 0u8;
        let mut ctx = StageInitCtx {
            consumer_cfg: EndpointCfg {
                use_encapsulation: false,
                delayed_action: false,
                channel_count: 1,
                audio_payload_size: 0,
                queue_size: 1,
            },
            mem_pool: &mut pool,
            extra_queue_size: &mut extra,
            consumer_underflow_count: 0,
        };
        assert!(matches!(stage.init(&mut ctx), Err(Error::ProcessingStageInit)));
    }
}
