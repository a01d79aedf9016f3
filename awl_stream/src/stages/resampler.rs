//! Sample rate conversion stage.
//!
//! Integer-ratio conversion built from the polyphase FIR kernels: the
//! stream is interpolated by `multiply_ratio`, then decimated by
//! `divide_ratio`, each with per-channel filter state. Coefficients are
//! fixed 24-tap Hamming-windowed low-pass designs, one base set per ratio
//! for decimation and a ratio-scaled set for interpolation to compensate
//! the zero-stuffing gain loss.
//!
//! The discard path bypasses the filters but keeps an accumulator of the
//! trailing `num_taps` samples. Switching between discard and process
//! compensates the filter latency manually, so the audible transition is
//! seamless: on entry to processing the decimator emits its accumulator
//! content manually decimated and the interpolator repeats inputs in place
//! of its zero-stuffed warmup.

use alloc::vec::Vec;

use awl_dsp::fir::{FirDecimator, FirInterpolator, FirSampleFormat};

use crate::error::{Error, Result};
use crate::format::{BitDepth, SampleEncoding, SampleFormat, WORD_SIZE_BYTES};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Filter length; divisible by every supported ratio since the polyphase
/// phase length is `FIR_NUM_TAPS / ratio`.
const FIR_NUM_TAPS: usize = 24;

/// The interpolator and decimator each contribute half the `FIR_NUM_TAPS`
/// latency; the discard transition splits its correction accordingly.
const FIR_LATENCY_SPLIT: usize = 2;

/* Half of initial sampling frequency. */
static FIR_N24_C0_35_W_HAMMING_32BIT: [i32; FIR_NUM_TAPS] = [
    373831,     -5398190,  -9034464,  1428966,   27704979,  35768973,  -16611028, -102718003,
    -102343356, 94026137,  437870567, 712673411, 712673411, 437870567, 94026137,  -102343356,
    -102718003, -16611028, 35768973,  27704979,  1428966,   -9034464,  -5398190,  373831,
];

/* Same filter with coefficients multiplied by 2 to compensate for the
 * interpolation zero-stuffing gain loss. */
static FIR_N24_C0_35_W_HAMMING_X2_GAIN_32BIT: [i32; FIR_NUM_TAPS] = [
    747662,     -10796381, -18068928, 2857933,    55409959,   71537947,  -33222056, -205436007,
    -204686713, 188052275, 875741134, 1425346823, 1425346823, 875741134, 188052275, -204686713,
    -205436007, -33222056, 71537947,  55409959,   2857933,    -18068928, -10796381, 747662,
];

/* Third of initial sampling frequency. */
static FIR_N24_C0_20_W_HAMMING_32BIT: [i32; FIR_NUM_TAPS] = [
    3830811,   1944310,   -3254016,  -14643242, -29801855, -37819816, -21852163, 32441298,
    126699149, 244179808, 353138497, 418879042, 418879042, 353138497, 244179808, 126699149,
    32441298,  -21852163, -37819816, -29801855, -14643242, -3254016,  1944310,   3830811,
];

static FIR_N24_C0_20_W_HAMMING_X3_GAIN_32BIT: [i32; FIR_NUM_TAPS] = [
    11492434,  5832931,   -9762050,   -43929727,  -89405567,  -113459450, -65556491, 97323896,
    380097448, 732539426, 1059415492, 1256637128, 1256637128, 1059415492, 732539426, 380097448,
    97323896,  -65556491, -113459450, -89405567,  -43929727,  -9762050,   5832931,   11492434,
];

/* Fourth of initial sampling frequency. */
static FIR_N24_C0_15_W_HAMMING_32BIT: [i32; FIR_NUM_TAPS] = [
    -3624579,  -6158766,  -10307372, -13854923, -11480531, 3692190,   37194283,  90107443,
    157164413, 227093189, 285371665, 318544811, 318544811, 285371665, 227093189, 157164413,
    90107443,  37194283,  3692190,   -11480531, -13854923, -10307372, -6158766,  -3624579,
];

static FIR_N24_C0_15_W_HAMMING_X4_GAIN_32BIT: [i32; FIR_NUM_TAPS] = [
    -14498319, -24635067, -41229489,  -55419694,  -45922124,  14768761,   148777134, 360429775,
    628657654, 908372756, 1141486663, 1274179246, 1274179246, 1141486663, 908372756, 628657654,
    360429775, 148777134, 14768761,   -45922124,  -55419694,  -41229489,  -24635067, -14498319,
];

/* Sixth of initial sampling frequency. */
static FIR_N24_C0_10_W_HAMMING_32BIT: [i32; FIR_NUM_TAPS] = [
    -2390937,  -1094722,  1832137,   9139335,   23437783,  46326649,  77681972,  115325150,
    155197661, 192036148, 220405496, 235845147, 235845147, 220405496, 192036148, 155197661,
    115325150, 77681972,  46326649,  23437783,  9139335,   1832137,   -1094722,  -2390937,
];

static FIR_N24_C0_10_W_HAMMING_X6_GAIN_32BIT: [i32; FIR_NUM_TAPS] = [
    -14345622, -6568333,   10992826,   54836011,   140626703,  277959898,  466091835,  691950904,
    931185971, 1152216889, 1322432976, 1415070883, 1415070883, 1322432976, 1152216889, 931185971,
    691950904, 466091835,  277959898,  140626703,  54836011,   10992826,   -6568333,   -14345622,
];

/// Supported conversion ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SrcRatio {
    /// No conversion on this side.
    One = 1,
    /// Factor of two.
    Two = 2,
    /// Factor of three.
    Three = 3,
    /// Factor of four.
    Four = 4,
    /// Factor of six.
    Six = 6,
}

impl SrcRatio {
    #[inline]
    fn factor(self) -> usize {
        self as usize
    }

    fn interpolation_coeffs(self) -> Option<&'static [i32; FIR_NUM_TAPS]> {
        match self {
            SrcRatio::One => None,
            SrcRatio::Two => Some(&FIR_N24_C0_35_W_HAMMING_X2_GAIN_32BIT),
            SrcRatio::Three => Some(&FIR_N24_C0_20_W_HAMMING_X3_GAIN_32BIT),
            SrcRatio::Four => Some(&FIR_N24_C0_15_W_HAMMING_X4_GAIN_32BIT),
            SrcRatio::Six => Some(&FIR_N24_C0_10_W_HAMMING_X6_GAIN_32BIT),
        }
    }

    fn decimation_coeffs(self) -> Option<&'static [i32; FIR_NUM_TAPS]> {
        match self {
            SrcRatio::One => None,
            SrcRatio::Two => Some(&FIR_N24_C0_35_W_HAMMING_32BIT),
            SrcRatio::Three => Some(&FIR_N24_C0_20_W_HAMMING_32BIT),
            SrcRatio::Four => Some(&FIR_N24_C0_15_W_HAMMING_32BIT),
            SrcRatio::Six => Some(&FIR_N24_C0_10_W_HAMMING_32BIT),
        }
    }
}

/// Rate converter configuration.
#[derive(Debug, Clone, Copy)]
pub struct SrcCfg {
    /// Input payload size in bytes.
    pub payload_size: u16,
    /// Interleaved channel count.
    pub channel_count: u8,
    /// Upsampling factor applied first.
    pub multiply_ratio: SrcRatio,
    /// Downsampling factor applied second.
    pub divide_ratio: SrcRatio,
    /// Format of the input samples.
    pub input_sample_format: SampleFormat,
    /// Format of the output samples.
    pub output_sample_format: SampleFormat,
}

/// Polyphase FIR sample rate conversion stage.
pub struct ResamplerStage {
    /// Stage configuration.
    pub cfg: SrcCfg,
    interpolators: Vec<FirInterpolator>,
    decimators: Vec<FirDecimator>,
    multiply_out: Vec<u8>,
    discard_accumulator: Vec<u8>,
    discard_active: bool,
}

fn word_size(format: SampleFormat) -> u16 {
    match format.sample_encoding {
        SampleEncoding::Packed => format.bit_depth.bits() / 8,
        SampleEncoding::Unpacked => WORD_SIZE_BYTES,
    }
}

fn fir_format(format: SampleFormat, size_bytes: u16) -> Result<FirSampleFormat> {
    match format.bit_depth {
        BitDepth::Bits16 => Ok(FirSampleFormat::bits16(size_bytes as u8)),
        BitDepth::Bits24 => Ok(FirSampleFormat::bits24(size_bytes as u8)),
        _ => Err(Error::ProcessingStageInit),
    }
}

impl ResamplerStage {
    /// Create a rate conversion stage.
    pub fn new(cfg: SrcCfg) -> Self {
        Self {
            cfg,
            interpolators: Vec::new(),
            decimators: Vec::new(),
            multiply_out: Vec::new(),
            discard_accumulator: Vec::new(),
            discard_active: false,
        }
    }

    pub(crate) fn init(&mut self, ctx: &mut StageInitCtx<'_>) -> Result<()> {
        let cfg = self.cfg;
        if cfg.payload_size == 0 || cfg.channel_count == 0 {
            return Err(Error::ProcessingStageInit);
        }
        if cfg.multiply_ratio == SrcRatio::One && cfg.divide_ratio == SrcRatio::One {
            return Err(Error::ProcessingStageInit);
        }

        let in_size = word_size(cfg.input_sample_format);
        let out_size = word_size(cfg.output_sample_format);
        let input_format = fir_format(cfg.input_sample_format, in_size)?;
        let output_format = fir_format(cfg.output_sample_format, out_size)?;

        if cfg.multiply_ratio > SrcRatio::One {
            let coeffs = cfg
                .multiply_ratio
                .interpolation_coeffs()
                .ok_or(Error::ProcessingStageInit)?;
            let block_size = usize::from(cfg.payload_size / in_size);
            // Interpolator output feeds the decimator in the input format.
            let mid_format = if cfg.divide_ratio > SrcRatio::One {
                input_format
            } else {
                output_format
            };
            self.interpolators = Vec::with_capacity(usize::from(cfg.channel_count));
            for _ in 0..cfg.channel_count {
                let state = ctx
                    .mem_pool
                    .alloc_slice::<i32>(FIR_NUM_TAPS + block_size)
                    .ok_or(Error::NotEnoughMemory)?;
                let interpolator = FirInterpolator::new(
                    cfg.multiply_ratio as u8,
                    FIR_NUM_TAPS as u16,
                    coeffs,
                    state,
                    block_size,
                    input_format,
                    mid_format,
                )
                .map_err(|_| Error::ProcessingStageInit)?;
                self.interpolators.push(interpolator);
            }
        }

        if cfg.divide_ratio > SrcRatio::One {
            let coeffs = cfg
                .divide_ratio
                .decimation_coeffs()
                .ok_or(Error::ProcessingStageInit)?;
            if cfg.multiply_ratio > SrcRatio::One {
                let bytes = usize::from(cfg.payload_size) * cfg.multiply_ratio.factor();
                self.multiply_out = ctx
                    .mem_pool
                    .alloc_bytes(bytes)
                    .ok_or(Error::NotEnoughMemory)?
                    .into_vec();
            }

            let block_size = usize::from(cfg.payload_size / in_size) * cfg.multiply_ratio.factor();
            self.decimators = Vec::with_capacity(usize::from(cfg.channel_count));
            for _ in 0..cfg.channel_count {
                let state = ctx
                    .mem_pool
                    .alloc_slice::<i32>(FIR_NUM_TAPS + block_size)
                    .ok_or(Error::NotEnoughMemory)?;
                let decimator = FirDecimator::new(
                    FIR_NUM_TAPS as u16,
                    cfg.divide_ratio as u8,
                    coeffs,
                    state,
                    block_size,
                    input_format,
                    output_format,
                )
                .map_err(|_| Error::ProcessingStageInit)?;
                self.decimators.push(decimator);
            }

            let accumulator_size =
                usize::from(cfg.channel_count) * FIR_NUM_TAPS * usize::from(in_size);
            if usize::from(cfg.payload_size) < accumulator_size {
                return Err(Error::ProcessingStageInit);
            }
            self.discard_accumulator = ctx
                .mem_pool
                .alloc_bytes(accumulator_size)
                .ok_or(Error::NotEnoughMemory)?
                .into_vec();
        }

        Ok(())
    }

    pub(crate) fn ctrl(&mut self, _cmd: u8, _arg: u32) -> Result<u32> {
        Err(Error::InvalidCmd)
    }

    pub(crate) fn process(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        let cfg = self.cfg;
        let in_size = usize::from(word_size(cfg.input_sample_format));
        let out_size = usize::from(word_size(cfg.output_sample_format));
        let channels = usize::from(cfg.channel_count);
        let multiply = cfg.multiply_ratio.factor();
        let divide = cfg.divide_ratio.factor();

        let mut sample_count_in = input.len() / in_size;
        let mut sample_count_out = 0usize;
        let mut fir_input_offset = 0usize;

        if multiply > 1 {
            let accumulator_sample_count = (FIR_NUM_TAPS / multiply) * channels;

            if input.len() != usize::from(cfg.payload_size) {
                let expected_discard_input = usize::from(cfg.payload_size) / in_size
                    + accumulator_sample_count / FIR_LATENCY_SPLIT;
                if sample_count_in == expected_discard_input {
                    // Transition packet out of discard mode.
                    self.discard_active = true;
                } else {
                    return Err(Error::InvalidPacketSize);
                }
            }

            if self.discard_active {
                // The front of a transition packet replays decimator latency;
                // the interpolator starts past it.
                fir_input_offset =
                    (accumulator_sample_count / FIR_LATENCY_SPLIT) * in_size;
                sample_count_in -= accumulator_sample_count / FIR_LATENCY_SPLIT;
            }

            let fir_input = &input[fir_input_offset..];
            let block = sample_count_in / channels;
            if divide > 1 {
                for (ch, interpolator) in self.interpolators.iter_mut().enumerate() {
                    interpolator.process(fir_input, &mut self.multiply_out, block, ch, channels);
                }
            } else {
                for (ch, interpolator) in self.interpolators.iter_mut().enumerate() {
                    interpolator.process(fir_input, output, block, ch, channels);
                }
            }
            sample_count_out = sample_count_in * multiply;
        }

        if divide > 1 {
            let block;
            if multiply > 1 {
                sample_count_in = sample_count_out;
                block = sample_count_in / channels;
                for (ch, decimator) in self.decimators.iter_mut().enumerate() {
                    decimator.process(&self.multiply_out, output, block, ch, channels);
                }
            } else {
                block = sample_count_in / channels;
                for (ch, decimator) in self.decimators.iter_mut().enumerate() {
                    decimator.process(input, output, block, ch, channels);
                }
            }
            sample_count_out = sample_count_in / divide;
        }

        if self.discard_active {
            self.discard_active = false;

            let copy = in_size.min(out_size);
            // Discard transitions support integer ratios only: one of the
            // two manual sections runs, never both.
            if multiply > 1 && divide == 1 {
                // Manual interpolation: repeat each input frame `multiply`
                // times in place of the filters' zero-stuffed warmup.
                for frame in (0..sample_count_in).step_by(channels) {
                    for ch in 0..channels {
                        for rep in 0..multiply {
                            let dst =
                                (frame * multiply + ch + channels * rep) * out_size;
                            let src = fir_input_offset + (frame + ch) * in_size;
                            output[dst..dst + copy].copy_from_slice(&input[src..src + copy]);
                        }
                    }
                }
            }
            if divide > 1 && multiply == 1 {
                // Manual decimation of the accumulator, then of the input.
                let accumulator_sample_count = (FIR_NUM_TAPS / divide) * channels;
                for frame in (0..accumulator_sample_count).step_by(channels) {
                    for ch in 0..channels {
                        let src = (frame * divide + ch) * in_size;
                        let dst = (frame + ch) * out_size;
                        output[dst..dst + copy]
                            .copy_from_slice(&self.discard_accumulator[src..src + copy]);
                    }
                }
                let manual_count =
                    sample_count_out - accumulator_sample_count / FIR_LATENCY_SPLIT;
                for frame in (0..manual_count).step_by(channels) {
                    for ch in 0..channels {
                        let src = (frame * divide + ch) * in_size;
                        let dst = (accumulator_sample_count + frame + ch) * out_size;
                        output[dst..dst + copy].copy_from_slice(&input[src..src + copy]);
                    }
                }
                sample_count_out += accumulator_sample_count / FIR_LATENCY_SPLIT;
            }
        }

        if divide > 1 {
            // Keep the trailing taps for the next discard transition.
            let tail = self.discard_accumulator.len();
            self.discard_accumulator
                .copy_from_slice(&input[input.len() - tail..]);
        }

        Ok((sample_count_out * out_size) as u16)
    }

    pub(crate) fn process_discard(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        self.discard_active = true;

        if self.cfg.divide_ratio > SrcRatio::One {
            // Delay the stream by the filter latency: replay the stored
            // accumulator, then the head of this packet.
            let tail = self.discard_accumulator.len();
            output[..tail].copy_from_slice(&self.discard_accumulator);
            output[tail..input.len()].copy_from_slice(&input[..input.len() - tail]);

            self.discard_accumulator
                .copy_from_slice(&input[input.len() - tail..]);

            Ok(input.len() as u16)
        } else {
            Ok(0)
        }
    }
}
