//! Audio core handle.
//!
//! [`AudioCore`] owns everything the streaming core needs: the memory
//! pool consumed at setup, the host HAL (critical section pair), the
//! optional mixer module and all pipelines. Every entry point threads
//! through the handle, so nothing in the crate is process-global and
//! several cores can coexist (e.g. in tests).

use alloc::vec::Vec;

use awl_core::{CriticalCfg, MemPool};

use crate::endpoint::Endpoint;
use crate::error::{Error, PipelineResult, Result};
use crate::mixer::{MixerCfg, MixerModule};
use crate::pipeline::{Pipeline, PipelineCfg};
use crate::stages::Processing;

/// Host-provided functions the core depends on.
#[derive(Clone, Copy)]
pub struct CoreHal {
    /// Enter a critical section; must mask every interrupt that can call
    /// into the core's produce/consume entry points.
    pub enter_critical: fn(),
    /// Exit a critical section.
    pub exit_critical: fn(),
}

impl CoreHal {
    /// No-op HAL for single-context use (host tests, offline tools).
    pub const fn noop() -> Self {
        fn nop() {}
        Self {
            enter_critical: nop,
            exit_critical: nop,
        }
    }
}

/// Audio core configuration.
#[derive(Debug, Clone, Copy)]
pub struct AudioCoreCfg {
    /// Byte budget for all setup-time allocations.
    pub memory_pool_size: usize,
}

/// Handle to a pipeline owned by an [`AudioCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub usize);

/// The streaming core: pool, HAL, mixer and pipelines.
pub struct AudioCore {
    pool: MemPool,
    hal: CoreHal,
    mixer: Option<MixerModule>,
    pipelines: Vec<Pipeline>,
}

impl AudioCore {
    /// Initialize the core with a memory budget and the host HAL.
    pub fn new(cfg: AudioCoreCfg, hal: CoreHal) -> Self {
        Self {
            pool: MemPool::new(cfg.memory_pool_size),
            hal,
            mixer: None,
            pipelines: Vec::new(),
        }
    }

    /// Initialize the mixer module. Only needed when pipelines mix.
    pub fn mixer_init(&mut self, cfg: MixerCfg) -> Result<()> {
        self.mixer = Some(MixerModule::new(cfg, &mut self.pool)?);
        Ok(())
    }

    /// The mixer module, when initialized.
    pub fn mixer(&self) -> Option<&MixerModule> {
        self.mixer.as_ref()
    }

    /// Create a pipeline from a producer, a configuration and a consumer.
    pub fn pipeline_init(
        &mut self,
        name: &'static str,
        producer: Endpoint,
        cfg: PipelineCfg,
        consumer: Endpoint,
    ) -> Result<PipelineId> {
        let critical = CriticalCfg {
            enter: self.hal.enter_critical,
            exit: self.hal.exit_critical,
        };
        let pipeline = Pipeline::new(name, producer, cfg, consumer, critical)?;
        self.pipelines.push(pipeline);
        Ok(PipelineId(self.pipelines.len() - 1))
    }

    /// Pipeline by id.
    pub fn pipeline(&self, id: PipelineId) -> &Pipeline {
        &self.pipelines[id.0]
    }

    /// Pipeline by id, mutable.
    pub fn pipeline_mut(&mut self, id: PipelineId) -> &mut Pipeline {
        &mut self.pipelines[id.0]
    }

    /// Append a processing stage to a pipeline; returns the stage index.
    pub fn add_processing(&mut self, id: PipelineId, processing: Processing) -> usize {
        self.pipelines[id.0].add_processing(processing)
    }

    /// Register `input` as a mixing source of `mixer_pipeline`.
    pub fn add_input_pipeline(
        &mut self,
        mixer_pipeline: PipelineId,
        input: PipelineId,
    ) -> Result<()> {
        if mixer_pipeline == input {
            return Err(Error::PipelineCfgInvalid);
        }
        if !self.pipelines[mixer_pipeline.0]
            .cfg()
            .mixer_option
            .output_mixer_pipeline
            || !self.pipelines[input.0].cfg().mixer_option.input_mixer_pipeline
        {
            return Err(Error::PipelineCfgInvalid);
        }
        let input_cap = self
            .mixer
            .as_ref()
            .map_or(crate::mixer::MAX_MIXER_INPUTS, |m| m.cfg.nb_of_inputs);
        let inputs = &mut self.pipelines[mixer_pipeline.0].input_pipelines;
        if inputs.len() >= usize::from(input_cap) {
            return Err(Error::MaximumReached);
        }
        inputs.push(input.0);
        Ok(())
    }

    /// Set up a pipeline: initialize its stages and provision its queues.
    /// Must be called last, after every other initialization call.
    pub fn pipeline_setup(&mut self, id: PipelineId) -> Result<()> {
        if self.pipelines[id.0].cfg().mixer_option.output_mixer_pipeline && self.mixer.is_none() {
            return Err(Error::MixerInitFailure);
        }
        self.pipelines[id.0].setup(&mut self.pool)
    }

    /// Start a pipeline's producer and arm the buffering threshold.
    pub fn pipeline_start(&mut self, id: PipelineId) {
        self.pipelines[id.0].start();
    }

    /// Stop a pipeline's endpoints, releasing the held producer node.
    pub fn pipeline_stop(&mut self, id: PipelineId) {
        self.pipelines[id.0].stop();
    }

    /// Advance a pipeline's producer endpoint. Safe to call from the
    /// producing I/O completion context.
    pub fn pipeline_produce(&mut self, id: PipelineId) -> PipelineResult {
        self.pipelines[id.0].produce()
    }

    /// Run one packet through a pipeline's processing chain.
    pub fn pipeline_process(&mut self, id: PipelineId) -> PipelineResult {
        let result = if self.pipelines[id.0].cfg().mixer_option.output_mixer_pipeline {
            self.process_mixing(id)
        } else {
            self.pipelines[id.0].process()
        };
        self.apply_mixer_delta(id);
        result
    }

    /// Advance a pipeline's consumer endpoint(s). Safe to call from the
    /// consuming I/O completion context.
    pub fn pipeline_consume(&mut self, id: PipelineId) -> PipelineResult {
        let result = self.pipelines[id.0].consume();
        self.apply_mixer_delta(id);
        result
    }

    /// Execute a processing stage control command.
    pub fn processing_ctrl(
        &mut self,
        id: PipelineId,
        stage_index: usize,
        cmd: u8,
        arg: u32,
    ) -> Result<u32> {
        self.pipelines[id.0]
            .processing_mut(stage_index)
            .ok_or(Error::InvalidArg)?
            .stage_mut()
            .ctrl(cmd, arg)
    }

    /// Bytes consumed from the memory pool so far.
    pub fn allocated_bytes(&self) -> usize {
        self.pool.allocated_bytes()
    }

    fn process_mixing(&mut self, id: PipelineId) -> PipelineResult {
        let mixer = self.mixer.as_mut().ok_or(Error::NotInit)?;
        let payload = usize::from(mixer.cfg.payload_size);
        let input_ids = self.pipelines[id.0].input_pipelines.clone();

        // Fill every input accumulation queue up to one payload, padding
        // with silence where an input pipeline has nothing buffered.
        for (slot, &input_id) in input_ids.iter().enumerate() {
            while usize::from(mixer.input_len(slot)) < payload {
                let input_pipeline = &mut self.pipelines[input_id];
                match input_pipeline.pop_mix_packet() {
                    Some(node) => {
                        mixer.append_samples(slot, input_pipeline.node_payload_bytes(node));
                        input_pipeline.free_mix_packet(node);
                    }
                    None => {
                        let silence = payload as u16 - mixer.input_len(slot);
                        mixer.append_silence(slot, silence);
                        // Arithmetic only: the silent samples keep the
                        // input pipeline's drift accounting moving.
                        input_pipeline.add_samples_buffered(u32::from(silence));
                    }
                }
            }
        }

        mixer.mix_packets();

        let mixer = self.mixer.as_ref().ok_or(Error::NotInit)?;
        self.pipelines[id.0].process_from_buffer(mixer.output_packet())
    }

    /// Mixing pipelines account consumed bytes against their inputs.
    fn apply_mixer_delta(&mut self, id: PipelineId) {
        let delta = self.pipelines[id.0].take_mixer_delta();
        if delta == 0 {
            return;
        }
        let input_ids = self.pipelines[id.0].input_pipelines.clone();
        for input_id in input_ids {
            self.pipelines[input_id].apply_samples_delta(delta);
        }
    }
}
