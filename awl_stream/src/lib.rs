//! # AWL Stream
//!
//! Real-time audio streaming core for wireless links. Moves PCM audio
//! between a local codec and a wireless transport through per-pipeline
//! chains of processing stages, with all packet storage pre-allocated at
//! setup:
//!
//! - pipelines over refcounted node pools (zero allocation on the audio
//!   path, multi-consumer fan-out by shared nodes),
//! - bit-width packing, IMA-ADPCM compression, polyphase FIR sample rate
//!   conversion and ramped volume stages,
//! - clock-drift compensation between the independent transmitter and
//!   receiver audio clocks, by corrective resampling or by audio-PLL
//!   FRACN adjustment,
//! - a link-quality fallback controller gating chain branches so quality
//!   degrades gracefully before the link does,
//! - an N-input mixer for pipelines that combine streams.
//!
//! The wireless transport and the codec driver stay outside, reachable
//! only through [`endpoint::EndpointOps`] and the monitor/HAL traits.
//!
//! # Example
//!
//! ```
//! use awl_stream::audio_core::{AudioCore, AudioCoreCfg, CoreHal};
//! use awl_stream::endpoint::{dummy::DummyEndpoint, Endpoint, EndpointCfg};
//! use awl_stream::endpoint::sine::{SineEndpoint, SineFreq};
//! use awl_stream::pipeline::PipelineCfg;
//!
//! let mut core = AudioCore::new(
//!     AudioCoreCfg { memory_pool_size: 16 * 1024 },
//!     CoreHal::noop(),
//! );
//!
//! let producer = Endpoint::new(
//!     "Sine EP",
//!     Box::new(SineEndpoint::new(SineFreq::Khz1)),
//!     EndpointCfg {
//!         use_encapsulation: false,
//!         delayed_action: false,
//!         channel_count: 1,
//!         audio_payload_size: 96,
//!         queue_size: 3,
//!     },
//! )
//! .unwrap();
//! let consumer = Endpoint::new(
//!     "Null EP",
//!     Box::new(DummyEndpoint),
//!     EndpointCfg {
//!         use_encapsulation: false,
//!         delayed_action: false,
//!         channel_count: 1,
//!         audio_payload_size: 96,
//!         queue_size: 4,
//!     },
//! )
//! .unwrap();
//!
//! let pipeline = core
//!     .pipeline_init("Loopback", producer, PipelineCfg::default(), consumer)
//!     .unwrap();
//! core.pipeline_setup(pipeline).unwrap();
//! core.pipeline_start(pipeline);
//!
//! core.pipeline_produce(pipeline).unwrap();
//! core.pipeline_process(pipeline).unwrap();
//! core.pipeline_consume(pipeline).unwrap();
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod audio_core;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod header;
pub mod mixer;
pub mod pipeline;
pub mod stages;
pub mod stats;

pub use crate::audio_core::{AudioCore, AudioCoreCfg, CoreHal, PipelineId};
pub use crate::endpoint::{Endpoint, EndpointCfg, EndpointOps};
pub use crate::error::{Error, PipelineResult, Result, Warning};
pub use crate::format::{BitDepth, SampleEncoding, SampleFormat, packets_in_ms};
pub use crate::header::{AUDIO_HEADER_SIZE, AudioHeader};
pub use crate::pipeline::{MixerOption, Pipeline, PipelineCfg};
pub use crate::stages::{Gate, Processing, Stage};
pub use crate::stats::PipelineStats;
