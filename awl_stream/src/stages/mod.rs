//! Processing stages.
//!
//! A stage transforms one audio packet into another (or inspects it in
//! place). Stages are stored as a sum type and dispatched directly in the
//! pipeline loop; the per-sample inner loops live in the stage modules and
//! are specialized at init time, never per sample.
//!
//! A chain entry pairs a stage with an optional [`Gate`]. Gated stages
//! normally skip when their gate is closed; compression and rate
//! conversion instead run their state-warming *discard* path so a later
//! gate flip produces a seamless switch.

pub mod cdc;
pub mod cdc_pll;
pub mod compression;
pub mod fallback;
pub mod mute;
pub mod packing;
pub mod resampler;
pub mod volume;

use awl_core::MemPool;

use crate::endpoint::EndpointCfg;
use crate::error::Result;
use crate::header::AudioHeader;
use crate::stats::PipelineStats;

pub use cdc::CdcStage;
pub use cdc_pll::CdcPllStage;
pub use compression::CompressionStage;
pub use fallback::FallbackStage;
pub use mute::MuteStage;
pub use packing::PackingStage;
pub use resampler::ResamplerStage;
pub use volume::VolumeStage;

/// Predicate deciding whether a gated stage runs on a given packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Run while the fallback mode is active.
    FallbackOn,
    /// Run while the fallback mode is inactive.
    FallbackOff,
}

/// What a gated stage does when its gate is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateClosedBehavior {
    /// Skip the stage entirely.
    #[default]
    Skip,
    /// Run the stage's discard path to keep its state warm; the output is
    /// not used.
    Discard,
}

/// A chain entry: a named stage plus its gating.
pub struct Processing {
    /// Stage name for diagnostics.
    pub name: &'static str,
    pub(crate) stage: Stage,
    pub(crate) gate: Option<Gate>,
    pub(crate) gate_closed: GateClosedBehavior,
}

impl Processing {
    /// Ungated stage.
    pub fn new(name: &'static str, stage: Stage) -> Self {
        Self {
            name,
            stage,
            gate: None,
            gate_closed: GateClosedBehavior::Skip,
        }
    }

    /// Gated stage, skipped when the gate is closed.
    pub fn gated(name: &'static str, stage: Stage, gate: Gate) -> Self {
        Self {
            name,
            stage,
            gate: Some(gate),
            gate_closed: GateClosedBehavior::Skip,
        }
    }

    /// Gated stage that runs its discard path when the gate is closed.
    pub fn gated_discard(name: &'static str, stage: Stage, gate: Gate) -> Self {
        Self {
            name,
            stage,
            gate: Some(gate),
            gate_closed: GateClosedBehavior::Discard,
        }
    }

    /// The wrapped stage.
    #[inline]
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// The wrapped stage, mutable.
    #[inline]
    pub fn stage_mut(&mut self) -> &mut Stage {
        &mut self.stage
    }
}

/// Pipeline-side context available to a stage at init time.
pub(crate) struct StageInitCtx<'a> {
    /// Configuration of the pipeline's primary consumer.
    pub consumer_cfg: EndpointCfg,
    /// Memory pool for stage buffers.
    pub mem_pool: &'a mut MemPool,
    /// Accumulated extra consumer queue depth requested by stages.
    pub extra_queue_size: &'a mut u8,
    /// Consumer underflow count at init time.
    pub consumer_underflow_count: u32,
}

impl StageInitCtx<'_> {
    /// Request additional consumer queue depth; the total across all
    /// stages is clamped to `u8::MAX`.
    pub fn request_extra_queue(&mut self, extra: u8) -> Result<()> {
        if *self.extra_queue_size > u8::MAX - extra {
            return Err(crate::error::Error::MaximumReached);
        }
        *self.extra_queue_size += extra;
        Ok(())
    }
}

/// Pipeline-side context available to a stage per processed packet.
pub(crate) struct StageCtx<'a> {
    /// Configuration of the pipeline's primary consumer.
    pub consumer_cfg: EndpointCfg,
    /// Current consumer live-queue length.
    pub consumer_queue_len: u16,
    /// Consumer live-queue limit (configured size plus extras).
    pub consumer_queue_limit: u16,
    /// Whether the primary consumer finished initial buffering.
    pub consumer_buffering_complete: bool,
    /// Bytes of audio sitting in consumer queues.
    pub samples_buffered_size: u32,
    /// Pipeline statistics, writable for peak resets and reads.
    pub stats: &'a mut PipelineStats,
    /// Pipeline-visible fallback mode flag.
    pub fallback_active: &'a mut bool,
}

/// Type-erased container for all stage implementations.
pub enum Stage {
    /// Bit-width packing and unpacking.
    Packing(PackingStage),
    /// IMA-ADPCM compression / decompression.
    Compression(CompressionStage),
    /// Polyphase FIR sample rate conversion.
    Resampler(ResamplerStage),
    /// Ramped digital volume.
    Volume(VolumeStage),
    /// Clock-drift compensation by corrective resampling.
    Cdc(CdcStage),
    /// Clock-drift compensation by audio-PLL FRACN adjustment.
    CdcPll(CdcPllStage),
    /// Link-quality fallback controller.
    Fallback(FallbackStage),
    /// Zero output after consumer starvation.
    MuteOnUnderflow(MuteStage),
}

impl Stage {
    pub(crate) fn init(&mut self, ctx: &mut StageInitCtx<'_>) -> Result<()> {
        match self {
            Stage::Packing(stage) => stage.init(ctx),
            Stage::Compression(stage) => stage.init(ctx),
            Stage::Resampler(stage) => stage.init(ctx),
            Stage::Volume(stage) => stage.init(ctx),
            Stage::Cdc(stage) => stage.init(ctx),
            Stage::CdcPll(stage) => stage.init(ctx),
            Stage::Fallback(stage) => stage.init(ctx),
            Stage::MuteOnUnderflow(stage) => stage.init(ctx),
        }
    }

    pub(crate) fn process(
        &mut self,
        ctx: &mut StageCtx<'_>,
        header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        match self {
            Stage::Packing(stage) => stage.process(ctx, header, input, output),
            Stage::Compression(stage) => stage.process(ctx, header, input, output),
            Stage::Resampler(stage) => stage.process(ctx, header, input, output),
            Stage::Volume(stage) => stage.process(ctx, header, input, output),
            Stage::Cdc(stage) => stage.process(ctx, header, input, output),
            Stage::CdcPll(stage) => stage.process(ctx, header, input, output),
            Stage::Fallback(stage) => stage.process(ctx, header, input, output),
            Stage::MuteOnUnderflow(stage) => stage.process(ctx, header, input, output),
        }
    }

    /// State-warming path for stages that must track the stream while
    /// gated off. Stages without one leave the packet untouched.
    pub(crate) fn process_discard(
        &mut self,
        ctx: &mut StageCtx<'_>,
        header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        match self {
            Stage::Compression(stage) => stage.process_discard(ctx, header, input, output),
            Stage::Resampler(stage) => stage.process_discard(ctx, header, input, output),
            _ => Ok(0),
        }
    }

    /// Dispatch a control command with a 32-bit argument.
    pub fn ctrl(&mut self, cmd: u8, arg: u32) -> Result<u32> {
        match self {
            Stage::Packing(stage) => stage.ctrl(cmd, arg),
            Stage::Compression(stage) => stage.ctrl(cmd, arg),
            Stage::Resampler(stage) => stage.ctrl(cmd, arg),
            Stage::Volume(stage) => stage.ctrl(cmd, arg),
            Stage::Cdc(stage) => stage.ctrl(cmd, arg),
            Stage::CdcPll(stage) => stage.ctrl(cmd, arg),
            Stage::Fallback(stage) => stage.ctrl(cmd, arg),
            Stage::MuteOnUnderflow(stage) => stage.ctrl(cmd, arg),
        }
    }

    /// Display name of this stage type.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Stage::Packing(_) => "Packing",
            Stage::Compression(_) => "Compression",
            Stage::Resampler(_) => "Resampler",
            Stage::Volume(_) => "Volume",
            Stage::Cdc(_) => "CDC",
            Stage::CdcPll(_) => "CDC PLL",
            Stage::Fallback(_) => "Fallback",
            Stage::MuteOnUnderflow(_) => "Mute On Underflow",
        }
    }

    /// Downcast to the fallback stage.
    pub fn as_fallback(&self) -> Option<&FallbackStage> {
        match self {
            Stage::Fallback(stage) => Some(stage),
            _ => None,
        }
    }

    /// Downcast to the fallback stage, mutable.
    pub fn as_fallback_mut(&mut self) -> Option<&mut FallbackStage> {
        match self {
            Stage::Fallback(stage) => Some(stage),
            _ => None,
        }
    }

    /// Downcast to the resampling CDC stage.
    pub fn as_cdc(&self) -> Option<&CdcStage> {
        match self {
            Stage::Cdc(stage) => Some(stage),
            _ => None,
        }
    }

    /// Downcast to the PLL CDC stage, mutable.
    pub fn as_cdc_pll_mut(&mut self) -> Option<&mut CdcPllStage> {
        match self {
            Stage::CdcPll(stage) => Some(stage),
            _ => None,
        }
    }

    /// Downcast to the volume stage.
    pub fn as_volume(&self) -> Option<&VolumeStage> {
        match self {
            Stage::Volume(stage) => Some(stage),
            _ => None,
        }
    }

    pub(crate) fn is_fallback(&self) -> bool {
        matches!(self, Stage::Fallback(_))
    }
}

impl From<PackingStage> for Stage {
    fn from(stage: PackingStage) -> Self {
        Stage::Packing(stage)
    }
}

impl From<CompressionStage> for Stage {
    fn from(stage: CompressionStage) -> Self {
        Stage::Compression(stage)
    }
}

impl From<ResamplerStage> for Stage {
    fn from(stage: ResamplerStage) -> Self {
        Stage::Resampler(stage)
    }
}

impl From<VolumeStage> for Stage {
    fn from(stage: VolumeStage) -> Self {
        Stage::Volume(stage)
    }
}

impl From<CdcStage> for Stage {
    fn from(stage: CdcStage) -> Self {
        Stage::Cdc(stage)
    }
}

impl From<CdcPllStage> for Stage {
    fn from(stage: CdcPllStage) -> Self {
        Stage::CdcPll(stage)
    }
}

impl From<FallbackStage> for Stage {
    fn from(stage: FallbackStage) -> Self {
        Stage::Fallback(stage)
    }
}

impl From<MuteStage> for Stage {
    fn from(stage: MuteStage) -> Self {
        Stage::MuteOnUnderflow(stage)
    }
}
