//! # AWL DSP
//!
//! Fixed-point DSP kernels used by the streaming pipeline: the IMA-ADPCM
//! codec, polyphase FIR interpolation/decimation for integer-ratio sample
//! rate conversion, and the single-sample linear-interpolation resampler
//! used by clock-drift compensation.
//!
//! Everything here is allocation-free after construction and keeps integer
//! arithmetic on the sample path.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod adpcm;
pub mod fir;
pub mod resampling;

pub use adpcm::AdpcmState;
pub use fir::{FirDecimator, FirError, FirInterpolator, FirSampleFormat};
pub use resampling::{BufferType, Correction, Resampler, ResamplerConfig, ResamplingStatus};
