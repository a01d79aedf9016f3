//! Clock-drift compensation by audio-PLL FRACN adjustment.
//!
//! Same queue-load averaging as the resampling CDC, but the corrective
//! action nudges the platform audio PLL's fractional-N divider instead of
//! touching samples: a proportional offset derived from the queue error,
//! plus a small integrator that cancels static error while the drift sits
//! inside a dead-band. Queue watermarks override everything: a near-full
//! queue pins the clock fast, a near-empty queue pins it slow, and a run of
//! remote TX-queue-high packets drops the offset entirely.

use alloc::boxed::Box;

use crate::error::{Error, Result};
use crate::format::{SampleEncoding, SampleFormat, WORD_SIZE_BYTES};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Scaling factor applied to queue-load measurements for resolution.
const DECIMAL_FACTOR: u32 = 1000;

/// Integrator trip point in multiples of [`DECIMAL_FACTOR`].
const INTEGRATOR_FACTOR: i32 = 5;

/// Dead-band below which the drift is considered stable.
const DRIFT_THRESHOLD: i32 = (DECIMAL_FACTOR / 4) as i32;

/// Clamp for the FRACN offset.
const MAX_PLL_FRACN_OFFSET: i32 = (DECIMAL_FACTOR / 2) as i32;

/// Divisor converting queue error into a FRACN offset.
const ERROR_DIVISOR: i32 = (DECIMAL_FACTOR / 3) as i32;

/// Rolling average depth in measurements.
const QUEUE_ARRAY_SIZE: usize = 2000;

/// Extra consumer queue depth needed around watermark excursions.
const DEFAULT_EXTRA_QUEUE_SIZE: u8 = 3;

/// Queue level considered near-empty.
const QUEUE_LOW_LEVEL_THRESHOLD: u16 = 1;

/// PLL CDC control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CdcPllCmd {
    /// Increment the FRACN register by one.
    Increase = 0,
    /// Decrement the FRACN register by one.
    Decrease = 1,
    /// Set the target queue size in packets.
    SetTargetQueueSize = 2,
}

/// Platform audio-PLL access.
pub trait PllHal {
    /// Read the fractional-N register.
    fn fracn(&mut self) -> u32;
    /// Write the fractional-N register.
    fn set_fracn(&mut self, value: u32);
}

/// PLL HAL limits and defaults.
#[derive(Debug, Clone, Copy)]
pub struct PllRange {
    /// Smallest legal FRACN value.
    pub fracn_min: u32,
    /// Largest legal FRACN value.
    pub fracn_max: u32,
    /// Nominal FRACN value.
    pub fracn_default: u32,
}

/// PLL CDC statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CdcPllStats {
    /// Target queue size in packets.
    pub target_queue_size: u32,
    /// Average queue size in packets.
    pub avg_queue_size: u32,
    /// Queue size error in packets.
    pub queue_size_error: i32,
    /// Change of the average across the last full window.
    pub queue_size_avg_delta: i32,
    /// Current FRACN register value.
    pub current_pll_value: u32,
    /// Offset currently applied to the FRACN register.
    pub pll_fracn_offset: i32,
}

/// FRACN-adjusting clock-drift compensation stage.
pub struct CdcPllStage {
    /// Format of the audio samples.
    pub sample_format: SampleFormat,
    hal: Box<dyn PllHal>,
    range: PllRange,
    sample_size: u16,
    sample_amount: u32,
    target_queue_size: u32,
    avg_arr: Box<[u8]>,
    avg_sum: u32,
    avg_val: u32,
    avg_idx: u16,
    prev_avg_val: u32,
    avg_val_delta: i32,
    error: i32,
    pll_fracn_offset: i32,
    queue_level_high: bool,
    queue_level_low: bool,
    tx_queue_level_high_count: u8,
    error_accumulator: i32,
    consumer_queue_size: u8,
}

impl CdcPllStage {
    /// Create a PLL CDC stage from a HAL and its register range.
    pub fn new(sample_format: SampleFormat, hal: Box<dyn PllHal>, range: PllRange) -> Self {
        Self {
            sample_format,
            hal,
            range,
            sample_size: 0,
            sample_amount: 0,
            target_queue_size: 0,
            avg_arr: Box::new([]),
            avg_sum: 0,
            avg_val: 0,
            avg_idx: 0,
            prev_avg_val: 0,
            avg_val_delta: 0,
            error: 0,
            pll_fracn_offset: 0,
            queue_level_high: false,
            queue_level_low: false,
            tx_queue_level_high_count: 0,
            error_accumulator: 0,
            consumer_queue_size: 0,
        }
    }

    pub(crate) fn init(&mut self, ctx: &mut StageInitCtx<'_>) -> Result<()> {
        if self.range.fracn_default == 0
            || self.range.fracn_max == 0
            || self.range.fracn_min > self.range.fracn_max
        {
            return Err(Error::ProcessingStageInit);
        }

        self.error = 0;
        self.pll_fracn_offset = 0;
        self.tx_queue_level_high_count = 0;
        self.error_accumulator = 0;

        self.sample_size = match self.sample_format.sample_encoding {
            SampleEncoding::Unpacked => WORD_SIZE_BYTES,
            SampleEncoding::Packed => {
                if self.sample_format.bit_depth.bits() % 8 != 0 {
                    return Err(Error::ProcessingStageInit);
                }
                self.sample_format.bit_depth.bits() / 8
            }
        };

        let consumer = ctx.consumer_cfg;
        self.sample_amount = u32::from(consumer.audio_payload_size)
            / (u32::from(consumer.channel_count) * u32::from(self.sample_size));
        self.target_queue_size =
            u32::from(consumer.queue_size) * self.sample_amount * DECIMAL_FACTOR;
        self.consumer_queue_size = consumer.queue_size;

        self.avg_arr = ctx
            .mem_pool
            .alloc_slice::<u8>(QUEUE_ARRAY_SIZE)
            .ok_or(Error::NotEnoughMemory)?;
        self.reset_queue_avg();

        ctx.request_extra_queue(DEFAULT_EXTRA_QUEUE_SIZE)
    }

    pub(crate) fn ctrl(&mut self, cmd: u8, arg: u32) -> Result<u32> {
        match cmd {
            c if c == CdcPllCmd::Increase as u8 => {
                let current = self.hal.fracn();
                self.hal.set_fracn(current + 1);
                Ok(0)
            }
            c if c == CdcPllCmd::Decrease as u8 => {
                let current = self.hal.fracn();
                self.hal.set_fracn(current - 1);
                Ok(0)
            }
            c if c == CdcPllCmd::SetTargetQueueSize as u8 => {
                if arg == 0 || arg > u32::from(self.consumer_queue_size) {
                    return Err(Error::InvalidArg);
                }
                self.target_queue_size = arg * self.sample_amount * DECIMAL_FACTOR;
                Ok(0)
            }
            _ => Err(Error::InvalidCmd),
        }
    }

    pub(crate) fn process(
        &mut self,
        ctx: &mut StageCtx<'_>,
        header: &mut AudioHeader,
        _input: &[u8],
        _output: &mut [u8],
    ) -> Result<u16> {
        let current_fracn = self.hal.fracn();

        self.update_queue_avg(ctx);

        if self.queue_level_high {
            // Speed consumption up to avoid an overflow.
            self.hal
                .set_fracn(offset_fracn(self.range.fracn_default, MAX_PLL_FRACN_OFFSET));
            self.pll_fracn_offset = MAX_PLL_FRACN_OFFSET;
            return Ok(0);
        }

        if header.tx_queue_level_high {
            if self.tx_queue_level_high_count > self.consumer_queue_size.saturating_sub(2)
                && self.pll_fracn_offset != 0
            {
                // A run of TX-high packets: the level is link-driven, drop
                // the correction.
                self.hal
                    .set_fracn(offset_fracn(current_fracn, -self.pll_fracn_offset));
                self.pll_fracn_offset = 0;
            }
            self.tx_queue_level_high_count = self.tx_queue_level_high_count.saturating_add(1);
            return Ok(0);
        }

        self.tx_queue_level_high_count = 0;
        if self.queue_level_low {
            // Slow consumption down to avoid an underflow.
            self.hal
                .set_fracn(offset_fracn(self.range.fracn_default, -MAX_PLL_FRACN_OFFSET));
            self.pll_fracn_offset = -MAX_PLL_FRACN_OFFSET;
            return Ok(0);
        }

        if self.avg_idx == 0 {
            // A full averaging window completed.
            if self.avg_val_delta.abs() < DRIFT_THRESHOLD {
                // Drift is stable: integrate to cancel static error.
                self.error_accumulator += self.error;
                if self.pll_fracn_offset > 0
                    && self.error_accumulator > INTEGRATOR_FACTOR * DECIMAL_FACTOR as i32
                {
                    self.pll_fracn_offset = 0;
                    self.error_accumulator = 0;
                } else if self.pll_fracn_offset < 0
                    && self.error_accumulator < -INTEGRATOR_FACTOR * DECIMAL_FACTOR as i32
                {
                    self.pll_fracn_offset = 0;
                    self.error_accumulator = 0;
                }
            } else {
                self.error_accumulator = 0;
            }

            self.adjust_latency();
        }

        // The PLL CDC never alters samples.
        Ok(0)
    }

    /// Statistics snapshot; reads the current FRACN from the HAL.
    pub fn stats(&mut self) -> CdcPllStats {
        CdcPllStats {
            target_queue_size: self.target_queue_size / self.sample_amount,
            avg_queue_size: self.avg_val / self.sample_amount,
            queue_size_error: self.error / self.sample_amount as i32,
            queue_size_avg_delta: self.avg_val_delta / self.sample_amount as i32,
            current_pll_value: self.hal.fracn(),
            pll_fracn_offset: self.pll_fracn_offset,
        }
    }

    fn adjust_latency(&mut self) {
        let current_offset = self.pll_fracn_offset;

        self.pll_fracn_offset =
            (self.error / ERROR_DIVISOR).clamp(-MAX_PLL_FRACN_OFFSET, MAX_PLL_FRACN_OFFSET);

        let adjust = self.pll_fracn_offset - current_offset;
        let current_fracn = self.hal.fracn();
        self.hal.set_fracn(offset_fracn(current_fracn, adjust));
    }

    fn update_queue_avg(&mut self, ctx: &StageCtx<'_>) {
        let current_queue_length = (ctx.samples_buffered_size
            / (u32::from(ctx.consumer_cfg.channel_count)
                * u32::from(self.sample_size)
                * self.sample_amount)) as u16;

        self.queue_level_high =
            current_queue_length > ctx.consumer_queue_limit.saturating_sub(2);
        self.queue_level_low = current_queue_length <= QUEUE_LOW_LEVEL_THRESHOLD;

        let idx = usize::from(self.avg_idx);
        self.avg_sum -= u32::from(self.avg_arr[idx]);
        self.avg_arr[idx] = current_queue_length.min(u16::from(u8::MAX)) as u8;
        self.avg_sum += u32::from(self.avg_arr[idx]);
        self.avg_val =
            self.sample_amount * ((self.avg_sum * DECIMAL_FACTOR) / QUEUE_ARRAY_SIZE as u32);
        self.error = self.avg_val as i32 - self.target_queue_size as i32;

        self.avg_idx += 1;
        if usize::from(self.avg_idx) >= QUEUE_ARRAY_SIZE {
            self.avg_idx = 0;
            self.avg_val_delta = self.avg_val as i32 - self.prev_avg_val as i32;
            self.prev_avg_val = self.avg_val;
        }
    }

    fn reset_queue_avg(&mut self) {
        self.avg_idx = 0;
        self.avg_val = self.target_queue_size;
        self.prev_avg_val = self.target_queue_size;
        self.avg_val_delta = 0;
        self.avg_arr.fill(self.consumer_queue_size);
        self.avg_sum = u32::from(self.consumer_queue_size) * QUEUE_ARRAY_SIZE as u32;
    }
}

#[inline]
fn offset_fracn(base: u32, offset: i32) -> u32 {
    (i64::from(base) + i64::from(offset)) as u32
}
