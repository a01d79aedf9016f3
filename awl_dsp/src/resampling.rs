//! Single-sample resampling by linear interpolation.
//!
//! Adds or removes exactly one sample per channel over a configurable
//! window of samples, stretching the signal so the correction is inaudible.
//! This is the corrective half of queue-load clock-drift compensation: a
//! receiver whose consumer queue trends away from its target starts an
//! episode, the episode spans `resampling_length` samples, then the
//! instance returns to idle.
//!
//! The interpolation position walks a fixed-point axis sized by the sample
//! bit depth; a bias accumulator distributes the rounding remainder across
//! the window.

use core::fmt;

/// Maximum channel count supported per instance.
pub const MAX_CHANNELS: usize = 2;

/// Carried samples per channel between packets.
const LAST_SAMPLE_AMT: usize = 2;

/// Remove episodes run two steps shorter than add episodes.
const ADD_REM_DIFF: u32 = 2;

const LAST_SAMPLE_BYTES: usize = LAST_SAMPLE_AMT * MAX_CHANNELS * 4;

/// Configuration error returned by [`Resampler::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplingError {
    /// More channels than [`MAX_CHANNELS`], or zero.
    InvalidChannelCount,
    /// Resampling window shorter than one packet.
    InvalidLength,
}

impl fmt::Display for ResamplingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResamplingError::InvalidChannelCount => write!(f, "invalid channel count"),
            ResamplingError::InvalidLength => write!(f, "invalid resampling length"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ResamplingError {}

/// Sample bit depth of the buffers handed to [`Resampler::resample`].
///
/// The discriminant is the index of the sample MSB, which doubles as the
/// interpolation shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferType {
    /// 8-bit samples, one byte each.
    Bits8 = 7,
    /// 16-bit samples, two bytes each.
    Bits16 = 15,
    /// 20-bit samples in 32-bit words.
    Bits20 = 19,
    /// 24-bit samples in 32-bit words.
    Bits24 = 23,
    /// 32-bit samples.
    Bits32 = 31,
}

impl BufferType {
    #[inline]
    fn sample_size(self) -> usize {
        match self {
            BufferType::Bits8 => 1,
            BufferType::Bits16 => 2,
            BufferType::Bits20 | BufferType::Bits24 | BufferType::Bits32 => 4,
        }
    }
}

/// Correction an episode applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correction {
    /// Pass samples through unchanged.
    #[default]
    None,
    /// Insert one sample per channel over the window.
    AddSample,
    /// Drop one sample per channel over the window.
    RemoveSample,
}

/// Episode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplingStatus {
    /// Measurement paused until the remote transmit queue drains.
    WaitQueueFull,
    /// No episode in progress.
    Idle,
    /// Episode armed, starts on the next packet.
    Start,
    /// Episode in progress.
    Running,
}

/// Resampler configuration.
#[derive(Debug, Clone, Copy)]
pub struct ResamplerConfig {
    /// Samples per packet, all channels included.
    pub nb_sample: u16,
    /// Sample bit depth.
    pub buffer_type: BufferType,
    /// Episode length in samples per channel.
    pub resampling_length: u16,
    /// Interleaved channel count.
    pub nb_channel: u8,
}

/// One-sample add/remove resampler.
pub struct Resampler {
    status: ResamplingStatus,
    correction: Correction,
    buffer_type: BufferType,
    buffer_type_max: u32,
    last_sample: [u8; LAST_SAMPLE_BYTES],
    step_add: u32,
    step_rem: u32,
    bias: u32,
    bias_step_add: u32,
    bias_step_rem: u32,
    x_axis: i64,
    nb_channel: u8,
    max_x_axis: u32,
}

impl Resampler {
    /// Build an instance from a configuration.
    pub fn new(config: &ResamplerConfig) -> Result<Self, ResamplingError> {
        if config.nb_channel == 0 || config.nb_channel as usize > MAX_CHANNELS {
            return Err(ResamplingError::InvalidChannelCount);
        }

        let nb_sample_ch = u32::from(config.nb_sample) / u32::from(config.nb_channel);
        if nb_sample_ch == 0 {
            return Err(ResamplingError::InvalidLength);
        }

        // Round the window down to a whole number of packets.
        let resampling_size = (u32::from(config.resampling_length) / nb_sample_ch) * nb_sample_ch;
        if resampling_size <= ADD_REM_DIFF {
            return Err(ResamplingError::InvalidLength);
        }

        let buffer_type_max = 1u32 << (config.buffer_type as u32);
        let step_add = buffer_type_max / resampling_size;
        let step_rem = buffer_type_max / (resampling_size - ADD_REM_DIFF);
        let max_x_axis = ((f64::from(resampling_size - 1) / f64::from(resampling_size))
            * f64::from(buffer_type_max)) as u32;
        let bias_step_add = ((f64::from(buffer_type_max) / f64::from(resampling_size)
            - step_add as f64)
            * f64::from(buffer_type_max)) as u32;
        let bias_step_rem = ((f64::from(buffer_type_max) / f64::from(resampling_size - ADD_REM_DIFF)
            - step_rem as f64)
            * f64::from(buffer_type_max)) as u32;

        Ok(Self {
            status: ResamplingStatus::WaitQueueFull,
            correction: Correction::None,
            buffer_type: config.buffer_type,
            buffer_type_max,
            last_sample: [0; LAST_SAMPLE_BYTES],
            step_add,
            step_rem,
            bias: 0,
            bias_step_add,
            bias_step_rem,
            x_axis: 0,
            nb_channel: config.nb_channel,
            max_x_axis,
        })
    }

    /// Current episode state.
    #[inline]
    pub fn status(&self) -> ResamplingStatus {
        self.status
    }

    /// Force the episode state; used by drift detection to park or release
    /// the instance around remote queue-full periods.
    #[inline]
    pub fn set_status(&mut self, status: ResamplingStatus) {
        self.status = status;
    }

    /// Configured channel count.
    #[inline]
    pub fn channel_count(&self) -> u8 {
        self.nb_channel
    }

    /// Arm an episode with the given correction.
    pub fn start(&mut self, correction: Correction) {
        self.status = ResamplingStatus::Start;
        self.correction = correction;
    }

    /// Resample one packet. Returns the number of output samples written.
    pub fn resample(&mut self, input: &[u8], output: &mut [u8], sample_count: u16) -> u16 {
        if self.status == ResamplingStatus::Idle {
            return self.bypass(input, output, sample_count);
        }
        match self.correction {
            Correction::AddSample => self.add_sample(input, output, sample_count),
            Correction::RemoveSample => self.remove_sample(input, output, sample_count),
            Correction::None => self.bypass(input, output, sample_count),
        }
    }

    fn add_sample(&mut self, input: &[u8], output: &mut [u8], sample_count: u16) -> u16 {
        let nb_ch = self.nb_channel.max(1) as usize;
        let sample_count = sample_count as usize;
        let last = self.last_sample;
        let mut size = 0usize;

        if self.status == ResamplingStatus::Start {
            self.status = ResamplingStatus::Running;
            self.bias = self.bias_step_add;
            self.x_axis = i64::from(self.max_x_axis);
            // First resampled frame repeats the final frame of the
            // previous packet.
            for mux in 0..nb_ch {
                let v = read_at(self.buffer_type, &last, nb_ch + mux);
                write_at(self.buffer_type, output, size, v);
                size += 1;
            }
        } else if self.status == ResamplingStatus::Running {
            size += self.interp_linear(&last, nb_ch, &last, 0, output, 0, nb_ch);
        }

        // Bridge frame between the carried samples and this packet.
        size += self.interp_linear(input, 0, &last, nb_ch, output, size, nb_ch);

        // Interpolate the body of the packet.
        size += self.interp_linear(input, nb_ch, input, 0, output, size, sample_count - size);

        self.update_last_sample(input, sample_count);

        if self.x_axis <= i64::from(self.step_add) {
            // Episode complete: emit the final input frame verbatim.
            for _ in 0..nb_ch {
                let v = read_at(
                    self.buffer_type,
                    input,
                    size - nb_ch * LAST_SAMPLE_AMT,
                );
                write_at(self.buffer_type, output, size, v);
                size += 1;
            }
            self.stop();
        }

        size as u16
    }

    fn remove_sample(&mut self, input: &[u8], output: &mut [u8], sample_count: u16) -> u16 {
        let nb_ch = self.nb_channel.max(1) as usize;
        let sample_count = sample_count as usize;
        let last = self.last_sample;
        let mut size = 0usize;

        if self.status == ResamplingStatus::Start {
            self.status = ResamplingStatus::Running;
            self.bias = self.bias_step_rem;
            self.x_axis = i64::from(self.step_rem);
            for mux in 0..nb_ch {
                let v = read_at(self.buffer_type, &last, nb_ch + mux);
                write_at(self.buffer_type, output, size, v);
                size += 1;
            }
        } else if self.status == ResamplingStatus::Running {
            size += self.interp_linear(input, 0, &last, nb_ch, output, 0, nb_ch);
        }

        size += self.interp_linear(input, size, input, 0, output, size, sample_count - size);

        self.update_last_sample(input, sample_count);

        if self.x_axis >= i64::from(self.max_x_axis) {
            // Episode complete: skip one input frame.
            for _ in 0..nb_ch {
                let v = read_at(self.buffer_type, input, size);
                write_at(self.buffer_type, output, size, v);
                size += 1;
            }
            self.stop();
        }

        size as u16
    }

    fn bypass(&mut self, input: &[u8], output: &mut [u8], sample_count: u16) -> u16 {
        let nb_ch = self.nb_channel.max(1) as usize;
        let sample_count = sample_count as usize;
        let last = self.last_sample;
        let mut size = 0usize;

        for mux in 0..nb_ch {
            let v = read_at(self.buffer_type, &last, nb_ch + mux);
            write_at(self.buffer_type, output, size, v);
            size += 1;
        }

        let elem = self.buffer_type.sample_size();
        let body = (sample_count - size) * elem;
        output[size * elem..size * elem + body].copy_from_slice(&input[..body]);

        self.update_last_sample(input, sample_count);

        sample_count as u16
    }

    fn stop(&mut self) {
        self.status = ResamplingStatus::Idle;
        self.correction = Correction::None;
    }

    /// Linear interpolation of `size` samples between `y` (newer) and `y1`
    /// (older), advancing the fixed-point axis once per frame. Returns the
    /// number of samples written, which is short when the episode finishes
    /// mid-buffer.
    fn interp_linear(
        &mut self,
        y: &[u8],
        y_off: usize,
        y1: &[u8],
        y1_off: usize,
        output: &mut [u8],
        out_off: usize,
        size: usize,
    ) -> usize {
        let nb_ch = self.nb_channel as usize;
        let shift = self.buffer_type as u32;
        let mut idx = 0usize;

        while idx < size {
            let y1_value = i64::from(read_at(self.buffer_type, y1, y1_off + idx));
            let y_value = i64::from(read_at(self.buffer_type, y, y_off + idx));
            let interp = (y1_value + ((self.x_axis * (y_value - y1_value)) >> shift)) as i32;
            write_at(self.buffer_type, output, out_off + idx, interp);
            idx += 1;

            if idx % nb_ch != 0 {
                continue;
            }

            if self.correction == Correction::AddSample {
                self.bias += self.bias_step_add;
                let bias_comp = if self.bias >= self.buffer_type_max {
                    self.bias -= self.buffer_type_max;
                    1
                } else {
                    0
                };
                let step = i64::from(self.step_add + bias_comp);
                if self.x_axis > step {
                    self.x_axis -= step;
                } else {
                    break;
                }
            } else {
                self.bias += self.bias_step_rem;
                let bias_comp = if self.bias >= self.buffer_type_max {
                    self.bias -= self.buffer_type_max;
                    1
                } else {
                    0
                };
                self.x_axis += i64::from(self.step_rem + bias_comp);
                if self.x_axis > i64::from(self.max_x_axis) {
                    break;
                }
            }
        }

        idx
    }

    fn update_last_sample(&mut self, input: &[u8], sample_count: usize) {
        let nb_sample = LAST_SAMPLE_AMT * self.nb_channel as usize;
        for mux in 0..nb_sample {
            let v = read_at(
                self.buffer_type,
                input,
                sample_count - nb_sample + mux,
            );
            let bt = self.buffer_type;
            write_at(bt, &mut self.last_sample, mux, v);
        }
    }
}

#[inline]
fn read_at(buffer_type: BufferType, buf: &[u8], idx: usize) -> i32 {
    match buffer_type {
        BufferType::Bits8 => i32::from(buf[idx] as i8),
        BufferType::Bits16 => i32::from(i16::from_le_bytes([buf[2 * idx], buf[2 * idx + 1]])),
        BufferType::Bits20 | BufferType::Bits24 | BufferType::Bits32 => i32::from_le_bytes([
            buf[4 * idx],
            buf[4 * idx + 1],
            buf[4 * idx + 2],
            buf[4 * idx + 3],
        ]),
    }
}

#[inline]
fn write_at(buffer_type: BufferType, buf: &mut [u8], idx: usize, value: i32) {
    match buffer_type {
        BufferType::Bits8 => buf[idx] = value as u8,
        BufferType::Bits16 => {
            buf[2 * idx..2 * idx + 2].copy_from_slice(&(value as i16).to_le_bytes());
        }
        BufferType::Bits20 | BufferType::Bits24 | BufferType::Bits32 => {
            buf[4 * idx..4 * idx + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    const PACKET_SAMPLES: u16 = 48;

    fn mono_16() -> Resampler {
        Resampler::new(&ResamplerConfig {
            nb_sample: PACKET_SAMPLES,
            buffer_type: BufferType::Bits16,
            resampling_length: 480,
            nb_channel: 1,
        })
        .unwrap()
    }

    fn packet_of(value: i16) -> Vec<u8> {
        core::iter::repeat(value)
            .take(PACKET_SAMPLES as usize)
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = ResamplerConfig {
            nb_sample: 48,
            buffer_type: BufferType::Bits16,
            resampling_length: 480,
            nb_channel: 3,
        };
        assert!(matches!(
            Resampler::new(&cfg),
            Err(ResamplingError::InvalidChannelCount)
        ));

        cfg.nb_channel = 1;
        cfg.resampling_length = 10;
        assert!(matches!(
            Resampler::new(&cfg),
            Err(ResamplingError::InvalidLength)
        ));
    }

    #[test]
    fn test_initial_state_waits_for_queue() {
        let rs = mono_16();
        assert_eq!(rs.status(), ResamplingStatus::WaitQueueFull);
    }

    #[test]
    fn test_bypass_preserves_count_and_delays_one_frame() {
        let mut rs = mono_16();
        rs.set_status(ResamplingStatus::Idle);

        let input = packet_of(1000);
        let mut output = vec![0u8; input.len() + 16];
        let n = rs.resample(&input, &mut output, PACKET_SAMPLES);
        assert_eq!(n, PACKET_SAMPLES);

        // First output frame is the carried history (zero at startup), the
        // rest is the input shifted by one frame.
        assert_eq!(read_at(BufferType::Bits16, &output, 0), 0);
        for i in 1..PACKET_SAMPLES as usize {
            assert_eq!(read_at(BufferType::Bits16, &output, i), 1000);
        }

        // Second packet sees the warm history.
        let n = rs.resample(&input, &mut output, PACKET_SAMPLES);
        assert_eq!(n, PACKET_SAMPLES);
        assert_eq!(read_at(BufferType::Bits16, &output, 0), 1000);
    }

    #[test]
    fn test_add_episode_inserts_exactly_one_sample() {
        let mut rs = mono_16();
        rs.set_status(ResamplingStatus::Idle);

        let input = packet_of(2000);
        let mut output = vec![0u8; input.len() + 32];

        // Warm up the history.
        rs.resample(&input, &mut output, PACKET_SAMPLES);

        rs.start(Correction::AddSample);
        let mut total_out: u32 = 0;
        let mut total_in: u32 = 0;
        for _ in 0..64 {
            let n = rs.resample(&input, &mut output, PACKET_SAMPLES);
            total_in += u32::from(PACKET_SAMPLES);
            total_out += u32::from(n);
            for i in 0..n as usize {
                assert_eq!(read_at(BufferType::Bits16, &output, i), 2000);
            }
            if rs.status() == ResamplingStatus::Idle {
                break;
            }
        }
        assert_eq!(rs.status(), ResamplingStatus::Idle);
        assert_eq!(total_out, total_in + 1);
    }

    #[test]
    fn test_remove_episode_drops_exactly_one_sample() {
        let mut rs = mono_16();
        rs.set_status(ResamplingStatus::Idle);

        let input = packet_of(-1500);
        let mut output = vec![0u8; input.len() + 32];

        rs.resample(&input, &mut output, PACKET_SAMPLES);

        rs.start(Correction::RemoveSample);
        let mut total_out: u32 = 0;
        let mut total_in: u32 = 0;
        for _ in 0..64 {
            let n = rs.resample(&input, &mut output, PACKET_SAMPLES);
            total_in += u32::from(PACKET_SAMPLES);
            total_out += u32::from(n);
            for i in 0..n as usize {
                assert_eq!(read_at(BufferType::Bits16, &output, i), -1500);
            }
            if rs.status() == ResamplingStatus::Idle {
                break;
            }
        }
        assert_eq!(rs.status(), ResamplingStatus::Idle);
        assert_eq!(total_out, total_in - 1);
    }

    #[test]
    fn test_stereo_add_inserts_one_frame() {
        let mut rs = Resampler::new(&ResamplerConfig {
            nb_sample: PACKET_SAMPLES,
            buffer_type: BufferType::Bits16,
            resampling_length: 480,
            nb_channel: 2,
        })
        .unwrap();
        rs.set_status(ResamplingStatus::Idle);

        let input = packet_of(700);
        let mut output = vec![0u8; input.len() + 32];
        rs.resample(&input, &mut output, PACKET_SAMPLES);

        rs.start(Correction::AddSample);
        let mut total_out: u32 = 0;
        let mut total_in: u32 = 0;
        for _ in 0..64 {
            let n = rs.resample(&input, &mut output, PACKET_SAMPLES);
            total_in += u32::from(PACKET_SAMPLES);
            total_out += u32::from(n);
            if rs.status() == ResamplingStatus::Idle {
                break;
            }
        }
        assert_eq!(rs.status(), ResamplingStatus::Idle);
        // One extra sample per channel.
        assert_eq!(total_out, total_in + 2);
    }
}
