//! Clock-drift compensation by corrective resampling.
//!
//! Transmitter and receiver run from independent audio clocks; the
//! receiver's consumer queue load drifts up or down with the clock ratio.
//! This stage keeps a long rolling average of the queue load (in samples,
//! scaled for resolution) and, when the average leaves a window around the
//! target, starts a one-sample resampling episode to pull the latency back.
//!
//! While the remote transmitter reports a near-full TX queue through the
//! header bit, measurement pauses: the queue level is then governed by the
//! link, not by clock drift.

use alloc::boxed::Box;

use awl_dsp::resampling::{
    BufferType, Correction, Resampler, ResamplerConfig, ResamplingStatus,
};

use crate::error::{Error, Result};
use crate::format::{BitDepth, SampleEncoding, SampleFormat, WORD_SIZE_BYTES};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Scaling factor applied to queue-load measurements for resolution.
const DECIMAL_FACTOR: u32 = 100;

/// Extra consumer queue depth needed to absorb corrective episodes.
const DEFAULT_EXTRA_QUEUE_SIZE: u8 = 3;

/// Default resampling episode length in samples.
pub const DEFAULT_RESAMPLING_LENGTH: u16 = 1440;

/// Default rolling average depth in measurements.
pub const DEFAULT_QUEUE_AVERAGE: u16 = 1000;

/// CDC control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CdcCmd {
    /// Set the target queue size in packets.
    SetTargetQueueSize = 0,
}

/// Inflation/deflation statistics.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CdcResamplingStats {
    /// Packets lengthened by one sample.
    pub inflated_packets_count: u32,
    /// Packets shortened by one sample.
    pub deflated_packets_count: u32,
}

/// Queue-load-averaging clock-drift compensation stage.
pub struct CdcStage {
    /// Samples spanned by a corrective episode.
    pub resampling_length: u16,
    /// Measurements in the rolling queue average.
    pub queue_avg_size: u16,
    /// Format of the audio samples.
    pub sample_format: SampleFormat,
    resampler: Option<Resampler>,
    sample_size: u16,
    avg_arr: Box<[u16]>,
    avg_sum: u32,
    avg_val: u32,
    avg_idx: u16,
    count: u32,
    max_queue_offset: u32,
    normal_queue_size: u32,
    sample_amount: u32,
    consumer_queue_size: u8,
    wait_for_queue_full: bool,
    stats: CdcResamplingStats,
}

fn buffer_type(bit_depth: BitDepth) -> Result<BufferType> {
    Ok(match bit_depth {
        BitDepth::Bits16 => BufferType::Bits16,
        BitDepth::Bits20 => BufferType::Bits20,
        BitDepth::Bits24 => BufferType::Bits24,
        BitDepth::Bits32 => BufferType::Bits32,
        BitDepth::Bits18 => return Err(Error::ProcessingStageInit),
    })
}

impl CdcStage {
    /// Create a CDC stage with the default window and average depth.
    pub fn new(sample_format: SampleFormat) -> Self {
        Self {
            resampling_length: DEFAULT_RESAMPLING_LENGTH,
            queue_avg_size: DEFAULT_QUEUE_AVERAGE,
            sample_format,
            resampler: None,
            sample_size: 0,
            avg_arr: Box::new([]),
            avg_sum: 0,
            avg_val: 0,
            avg_idx: 0,
            count: 0,
            max_queue_offset: 0,
            normal_queue_size: 0,
            sample_amount: 0,
            consumer_queue_size: 0,
            wait_for_queue_full: false,
            stats: CdcResamplingStats::default(),
        }
    }

    pub(crate) fn init(&mut self, ctx: &mut StageInitCtx<'_>) -> Result<()> {
        self.sample_size = match self.sample_format.sample_encoding {
            SampleEncoding::Unpacked => WORD_SIZE_BYTES,
            SampleEncoding::Packed => {
                if self.sample_format.bit_depth.bits() % 8 != 0 {
                    return Err(Error::ProcessingStageInit);
                }
                self.sample_format.bit_depth.bits() / 8
            }
        };

        self.avg_sum = 0;
        self.avg_val = 0;
        self.avg_idx = 0;
        self.avg_arr = ctx
            .mem_pool
            .alloc_slice::<u16>(usize::from(self.queue_avg_size))
            .ok_or(Error::NotEnoughMemory)?;

        let consumer = ctx.consumer_cfg;
        let config = ResamplerConfig {
            nb_sample: consumer.audio_payload_size / self.sample_size,
            nb_channel: consumer.channel_count,
            resampling_length: self.resampling_length,
            buffer_type: buffer_type(self.sample_format.bit_depth)?,
        };
        self.resampler = Some(Resampler::new(&config).map_err(|_| Error::ProcessingStageInit)?);

        self.sample_amount = u32::from(consumer.audio_payload_size)
            / (u32::from(consumer.channel_count) * u32::from(self.sample_size));
        self.normal_queue_size =
            u32::from(consumer.queue_size) * self.sample_amount * DECIMAL_FACTOR;
        self.max_queue_offset = 3 * DECIMAL_FACTOR;
        self.consumer_queue_size = consumer.queue_size;
        self.count = 0;
        self.wait_for_queue_full = false;
        self.stats = CdcResamplingStats::default();

        ctx.request_extra_queue(DEFAULT_EXTRA_QUEUE_SIZE)
    }

    pub(crate) fn ctrl(&mut self, cmd: u8, arg: u32) -> Result<u32> {
        match cmd {
            c if c == CdcCmd::SetTargetQueueSize as u8 => {
                if arg == 0 || arg > u32::from(self.consumer_queue_size) {
                    return Err(Error::InvalidArg);
                }
                self.normal_queue_size = arg * self.sample_amount * DECIMAL_FACTOR;
                Ok(0)
            }
            _ => Err(Error::InvalidCmd),
        }
    }

    pub(crate) fn process(
        &mut self,
        ctx: &mut StageCtx<'_>,
        header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        let original_count = (input.len() / usize::from(self.sample_size)) as u16;

        self.detect_drift(ctx, header);

        let resampler = self.resampler.as_mut().ok_or(Error::NotInit)?;
        let new_count = resampler.resample(input, output, original_count);

        if new_count > original_count {
            self.stats.inflated_packets_count += 1;
        } else if new_count < original_count {
            self.stats.deflated_packets_count += 1;
        }

        Ok(new_count * self.sample_size)
    }

    /// Inflation/deflation counters.
    pub fn stats(&self) -> CdcResamplingStats {
        self.stats
    }

    /// Current normalized queue-load average.
    pub fn queue_avg(&self) -> u32 {
        self.avg_val
    }

    fn detect_drift(&mut self, ctx: &StageCtx<'_>, header: &AudioHeader) {
        // Only average while the audio link is stable.
        if !header.tx_queue_level_high {
            self.update_queue_avg(ctx);
        }

        let resampler = match self.resampler.as_mut() {
            Some(resampler) => resampler,
            None => return,
        };

        if header.tx_queue_level_high && resampler.status() == ResamplingStatus::Idle {
            self.wait_for_queue_full = true;
        }

        match resampler.status() {
            ResamplingStatus::WaitQueueFull => {
                if !header.tx_queue_level_high {
                    resampler.set_status(ResamplingStatus::Idle);
                    self.wait_for_queue_full = false;
                }
            }
            ResamplingStatus::Idle => {
                if self.wait_for_queue_full {
                    resampler.set_status(ResamplingStatus::WaitQueueFull);
                } else if self.count > u32::from(self.queue_avg_size) {
                    if self.avg_val > self.normal_queue_size + self.max_queue_offset {
                        resampler.start(Correction::RemoveSample);
                        self.count = 0;
                    } else if self.avg_val < self.normal_queue_size - self.max_queue_offset {
                        resampler.start(Correction::AddSample);
                        self.count = 0;
                    }
                } else {
                    // Let the average settle before acting on it.
                    self.count += 1;
                }
            }
            _ => {}
        }
    }

    fn update_queue_avg(&mut self, ctx: &StageCtx<'_>) {
        let current_queue_length = (ctx.samples_buffered_size
            / (u32::from(ctx.consumer_cfg.channel_count) * u32::from(self.sample_size)))
            as u16;
        let idx = usize::from(self.avg_idx);

        self.avg_sum -= u32::from(self.avg_arr[idx]);
        self.avg_arr[idx] = current_queue_length;
        self.avg_sum += u32::from(current_queue_length);
        self.avg_idx += 1;
        if self.avg_idx >= self.queue_avg_size {
            self.avg_idx = 0;
        }
        self.avg_val = (self.avg_sum * DECIMAL_FACTOR) / u32::from(self.queue_avg_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCfg;
    use crate::stats::PipelineStats;
    use alloc::vec;

    const PAYLOAD: u16 = 96; // 48 mono 16-bit samples

    fn fmt16() -> SampleFormat {
        SampleFormat {
            bit_depth: BitDepth::Bits16,
            sample_encoding: SampleEncoding::Packed,
        }
    }

    fn consumer_cfg() -> EndpointCfg {
        EndpointCfg {
            use_encapsulation: false,
            delayed_action: false,
            channel_count: 1,
            audio_payload_size: PAYLOAD,
            queue_size: 4,
        }
    }

    fn init_stage(queue_avg_size: u16) -> (CdcStage, u8) {
        let mut stage = CdcStage::new(fmt16());
        stage.queue_avg_size = queue_avg_size;
        stage.resampling_length = 480;
        let mut pool = awl_core::MemPool::new(16 * 1024);
        let mut extra = 0u8;
        let mut ctx = StageInitCtx {
            consumer_cfg: consumer_cfg(),
            mem_pool: &mut pool,
            extra_queue_size: &mut extra,
            consumer_underflow_count: 0,
        };
        stage.init(&mut ctx).unwrap();
        (stage, extra)
    }

    fn run(
        stage: &mut CdcStage,
        samples_buffered: u32,
        tx_high: bool,
        input: &[u8],
        output: &mut [u8],
    ) -> u16 {
        let mut stats = PipelineStats::default();
        let mut fallback = false;
        let mut ctx = StageCtx {
            consumer_cfg: consumer_cfg(),
            consumer_queue_len: 0,
            consumer_queue_limit: 7,
            consumer_buffering_complete: true,
            samples_buffered_size: samples_buffered,
            stats: &mut stats,
            fallback_active: &mut fallback,
        };
        let mut header = AudioHeader {
            tx_queue_level_high: tx_high,
            ..Default::default()
        };
        stage.process(&mut ctx, &mut header, input, output).unwrap()
    }

    #[test]
    fn test_requests_extra_queue() {
        let (_stage, extra) = init_stage(8);
        assert_eq!(extra, 3);
    }

    #[test]
    fn test_rejects_18bit() {
        let mut stage = CdcStage::new(SampleFormat {
            bit_depth: BitDepth::Bits18,
            sample_encoding: SampleEncoding::Packed,
        });
        let mut pool = awl_core::MemPool::new(16 * 1024);
        let mut extra = 0u8;
        let mut ctx = StageInitCtx {
            consumer_cfg: consumer_cfg(),
            mem_pool: &mut pool,
            extra_queue_size: &mut extra,
            consumer_underflow_count: 0,
        };
        assert!(stage.init(&mut ctx).is_err());
    }

    #[test]
    fn test_steady_queue_stays_idle() {
        let (mut stage, _) = init_stage(8);
        stage
            .resampler
            .as_mut()
            .unwrap()
            .set_status(ResamplingStatus::Idle);

        let input = vec![0u8; PAYLOAD as usize];
        let mut output = vec![0u8; PAYLOAD as usize + 16];
        // Target load: queue_size(4) * 48 samples.
        let target_bytes = 4 * 48 * 2;
        for _ in 0..40 {
            let n = run(&mut stage, target_bytes, false, &input, &mut output);
            assert_eq!(n, PAYLOAD);
        }
        assert_eq!(stage.stats().inflated_packets_count, 0);
        assert_eq!(stage.stats().deflated_packets_count, 0);
    }

    #[test]
    fn test_low_queue_triggers_inflation() {
        let (mut stage, _) = init_stage(8);
        stage
            .resampler
            .as_mut()
            .unwrap()
            .set_status(ResamplingStatus::Idle);

        let input = vec![17u8; PAYLOAD as usize];
        let mut output = vec![0u8; PAYLOAD as usize + 16];
        // Average 100 samples buffered vs target 192: well below the
        // 3-sample window.
        let mut inflated_total = 0u32;
        for _ in 0..64 {
            run(&mut stage, 100 * 2, false, &input, &mut output);
            inflated_total = stage.stats().inflated_packets_count;
            if inflated_total > 0 {
                break;
            }
        }
        assert!(inflated_total > 0, "no inflation triggered");
    }

    #[test]
    fn test_high_queue_triggers_deflation() {
        let (mut stage, _) = init_stage(8);
        stage
            .resampler
            .as_mut()
            .unwrap()
            .set_status(ResamplingStatus::Idle);

        let input = vec![0u8; PAYLOAD as usize];
        let mut output = vec![0u8; PAYLOAD as usize + 16];
        let mut deflated_total = 0u32;
        for _ in 0..64 {
            run(&mut stage, 400 * 2, false, &input, &mut output);
            deflated_total = stage.stats().deflated_packets_count;
            if deflated_total > 0 {
                break;
            }
        }
        assert!(deflated_total > 0, "no deflation triggered");
    }

    #[test]
    fn test_tx_high_pauses_measurement() {
        let (mut stage, _) = init_stage(4);
        stage
            .resampler
            .as_mut()
            .unwrap()
            .set_status(ResamplingStatus::Idle);

        let input = vec![0u8; PAYLOAD as usize];
        let mut output = vec![0u8; PAYLOAD as usize + 16];

        // Remote TX queue full: the stage parks in WaitQueueFull and takes
        // no corrective action no matter how low the local queue runs.
        for _ in 0..32 {
            run(&mut stage, 10, true, &input, &mut output);
        }
        assert_eq!(
            stage.resampler.as_ref().unwrap().status(),
            ResamplingStatus::WaitQueueFull
        );
        assert_eq!(stage.stats().inflated_packets_count, 0);

        // Bit clears: measurement resumes from idle.
        run(&mut stage, 10, false, &input, &mut output);
        assert_eq!(
            stage.resampler.as_ref().unwrap().status(),
            ResamplingStatus::Idle
        );
    }

    #[test]
    fn test_ctrl_target_queue_size() {
        let (mut stage, _) = init_stage(8);
        stage.ctrl(CdcCmd::SetTargetQueueSize as u8, 2).unwrap();
        assert_eq!(stage.normal_queue_size, 2 * 48 * 100);
        assert!(matches!(
            stage.ctrl(CdcCmd::SetTargetQueueSize as u8, 0),
            Err(Error::InvalidArg)
        ));
        assert!(matches!(
            stage.ctrl(CdcCmd::SetTargetQueueSize as u8, 9),
            Err(Error::InvalidArg)
        ));
        assert!(matches!(stage.ctrl(99, 0), Err(Error::InvalidCmd)));
    }
}
