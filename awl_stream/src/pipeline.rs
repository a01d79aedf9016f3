//! Pipeline runtime.
//!
//! A pipeline connects one producer endpoint to one or more consumer
//! endpoints through an ordered chain of processing stages. All packet
//! storage comes from per-pipeline node pools carved once at setup; the
//! runtime then moves node indexes between queues and never allocates.
//!
//! Three entry points drive a pipeline, typically from three contexts:
//! `produce` from the producing I/O completion (codec DMA or wireless RX),
//! `process` from the foreground loop, and `consume` from the consuming
//! I/O completion. Queue mutations synchronize through the critical
//! section pair supplied at core init.

use alloc::vec::Vec;

use awl_core::{CriticalCfg, MemPool, NodeBank, NodeId, QueueId, QueueStats};

use crate::endpoint::Endpoint;
use crate::error::{Error, PipelineResult, Result, Warning};
use crate::header::{AUDIO_HEADER_SIZE, AudioHeader};
use crate::stages::{Gate, GateClosedBehavior, Processing, StageCtx, StageInitCtx};
use crate::stats::PipelineStats;

/// Extra node bytes so CDC episodes can lengthen a packet by one sample
/// per channel.
const CDC_QUEUE_DATA_SIZE_INFLATION: u16 = 2 * 4;

/// Bytes reserved for the payload size bookkeeping of each node.
const PAYLOAD_SIZE_VAR_SIZE: u16 = 2;

/// Consumer queue length at which the header TX-high bit is raised.
const TX_QUEUE_HIGH_LEVEL: u16 = 2;

/// Nodes in the processing pool: one input, one output, swapped per stage.
const PROCESSING_NODE_COUNT: u16 = 2;

/// Free nodes reserved so an endpoint action can always start.
const EP_ACTION_NODE_COUNT: u8 = 1;

/// Free nodes reserved for the processing input copy.
const PROCESS_INPUT_NODE_COUNT: u8 = 1;

/// Smallest producer queue the runtime will provision.
const MIN_PRODUCER_QUEUE_SIZE: u8 = 1;

/// Mixer-specific pipeline options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixerOption {
    /// True for a pipeline feeding audio into the mixing stage.
    pub input_mixer_pipeline: bool,
    /// True for the pipeline draining the mixing stage.
    pub output_mixer_pipeline: bool,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineCfg {
    /// Wait for the consumer queue to fill before starting to consume.
    pub do_initial_buffering: bool,
    /// Mixer options.
    pub mixer_option: MixerOption,
}

/// One producer, a chain of processing stages, one or more consumers.
pub struct Pipeline {
    name: &'static str,
    cfg: PipelineCfg,
    producers: Vec<Endpoint>,
    consumers: Vec<Endpoint>,
    chain: Vec<Processing>,
    stats: PipelineStats,
    bank: NodeBank,
    critical: CriticalCfg,
    buffering_threshold: u8,
    samples_buffered_size: u32,
    processing_queue: Option<QueueId>,
    fallback_active: bool,
    is_setup: bool,
    pub(crate) input_pipelines: Vec<usize>,
    pub(crate) mixer_delta: i64,
}

impl Pipeline {
    pub(crate) fn new(
        name: &'static str,
        producer: Endpoint,
        cfg: PipelineCfg,
        consumer: Endpoint,
        critical: CriticalCfg,
    ) -> Result<Self> {
        if cfg.mixer_option.input_mixer_pipeline && cfg.mixer_option.output_mixer_pipeline {
            return Err(Error::MixerOption);
        }
        let mut producers = Vec::with_capacity(1);
        producers.push(producer);
        let mut consumers = Vec::with_capacity(1);
        consumers.push(consumer);
        Ok(Self {
            name,
            cfg,
            producers,
            consumers,
            chain: Vec::new(),
            stats: PipelineStats::default(),
            bank: NodeBank::new(critical),
            critical,
            buffering_threshold: 0,
            samples_buffered_size: 0,
            processing_queue: None,
            fallback_active: false,
            is_setup: false,
            input_pipelines: Vec::new(),
            mixer_delta: 0,
        })
    }

    /// Pipeline name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pipeline configuration.
    #[inline]
    pub fn cfg(&self) -> &PipelineCfg {
        &self.cfg
    }

    /// Statistics as of the last update.
    #[inline]
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Refresh the queue loads and return the statistics.
    pub fn update_stats(&mut self) -> &PipelineStats {
        if let Some(queue) = self.producers[0].queue {
            self.stats.producer_buffer_load = u32::from(self.bank.len(queue));
        }
        if let Some(queue) = self.consumers[0].queue {
            self.stats.consumer_buffer_load = u32::from(self.bank.len(queue));
        }
        &self.stats
    }

    /// Reset the statistics counters.
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Bytes of audio sitting in consumer queues.
    #[inline]
    pub fn samples_buffered_size(&self) -> u32 {
        self.samples_buffered_size
    }

    /// Current fallback mode as seen by the gates.
    #[inline]
    pub fn fallback_active(&self) -> bool {
        self.fallback_active
    }

    /// Iterate over the queue statistics of this pipeline's node bank.
    pub fn queue_stats(&self) -> impl Iterator<Item = QueueStats> + '_ {
        self.bank.queue_stats()
    }

    /// Primary consumer live-queue length.
    pub fn consumer_queue_len(&self) -> u16 {
        self.consumers[0].queue.map_or(0, |q| self.bank.len(q))
    }

    /// Primary producer live-queue length.
    pub fn producer_queue_len(&self) -> u16 {
        self.producers[0].queue.map_or(0, |q| self.bank.len(q))
    }

    /// Append a processing stage; returns its index for later control.
    pub fn add_processing(&mut self, processing: Processing) -> usize {
        self.chain.push(processing);
        self.chain.len() - 1
    }

    /// Chain entry by index.
    pub fn processing(&self, index: usize) -> Option<&Processing> {
        self.chain.get(index)
    }

    /// Chain entry by index, mutable.
    pub fn processing_mut(&mut self, index: usize) -> Option<&mut Processing> {
        self.chain.get_mut(index)
    }

    /// Add an extra consumer fed the same processed packets.
    pub fn add_extra_consumer(&mut self, consumer: Endpoint) {
        self.consumers.push(consumer);
    }

    /// Add an extra producer sharing the primary's free pool.
    pub fn add_extra_producer(&mut self, producer: Endpoint) {
        self.producers.push(producer);
    }

    /// Primary producer endpoint.
    pub fn producer(&self) -> &Endpoint {
        &self.producers[0]
    }

    /// Primary consumer endpoint.
    pub fn consumer(&self) -> &Endpoint {
        &self.consumers[0]
    }

    pub(crate) fn setup(&mut self, pool: &mut MemPool) -> Result<()> {
        // Initialize the processing stages; they may request extra
        // consumer queue depth.
        let mut extra_queue_size = self.consumers[0].extra_queue_size;
        let consumer_cfg = self.consumers[0].cfg;
        let consumer_underflow_count = self.stats.consumer_buffer_underflow_count;
        for processing in &mut self.chain {
            let mut ctx = StageInitCtx {
                consumer_cfg,
                mem_pool: &mut *pool,
                extra_queue_size: &mut extra_queue_size,
                consumer_underflow_count,
            };
            processing.stage_mut().init(&mut ctx)?;
        }
        self.consumers[0].extra_queue_size = extra_queue_size;

        // Gates need a fallback stage in the chain to read from.
        let has_fallback = self.chain.iter().any(|p| p.stage().is_fallback());
        if !has_fallback && self.chain.iter().any(|p| p.gate.is_some()) {
            return Err(Error::FallbackProcNotFound);
        }
        // Mirror the fallback startup state.
        self.fallback_active = has_fallback;

        self.init_audio_queues(pool)?;

        self.stats.producer_buffer_size = self
            .producers[0]
            .queue
            .map_or(0, |q| self.bank.limit(q));
        self.stats.consumer_buffer_size = self
            .consumers[0]
            .queue
            .map_or(0, |q| self.bank.limit(q));

        self.is_setup = true;
        Ok(())
    }

    pub(crate) fn start(&mut self) {
        // With initial buffering the consumer starts only once its queue
        // is about to be full; otherwise the first packet starts it.
        self.buffering_threshold = if self.cfg.do_initial_buffering {
            self.consumers[0].cfg.queue_size - 1
        } else {
            1
        };

        self.producers[0].ops.start();
    }

    pub(crate) fn stop(&mut self) {
        for consumer in &mut self.consumers {
            consumer.ops.stop();
        }
        self.producers[0].ops.stop();

        if let Some(node) = self.producers[0].current_node.take() {
            self.bank.free_node(node);
        }
    }

    /// Advance the producer endpoint: enqueue the completed node (delayed
    /// action) and start producing the next one.
    pub(crate) fn produce(&mut self) -> PipelineResult {
        if !self.is_setup {
            return Err(Error::NotInit);
        }

        if self.producers[0].cfg.delayed_action {
            if self.producers[0].current_node.is_some() {
                // Enqueue the finished node; a full queue drops the oldest
                // so the endpoint can always be reloaded.
                self.enqueue_producer_node();
            }
            let (_, produce_warning) = self.produce_action();
            Ok(produce_warning)
        } else {
            let (size, produce_warning) = self.produce_action();
            if produce_warning.is_some() {
                return Ok(produce_warning);
            }
            if size > 0 {
                Ok(self.enqueue_producer_node())
            } else {
                if let Some(node) = self.producers[0].current_node.take() {
                    // The endpoint returned no data.
                    self.bank.free_node(node);
                    self.stats.producer_packets_corrupted_count += 1;
                }
                Ok(None)
            }
        }
    }

    /// Run one packet through the processing chain and fan it out to the
    /// consumers.
    pub(crate) fn process(&mut self) -> PipelineResult {
        if !self.is_setup {
            return Err(Error::NotInit);
        }

        self.check_buffering();

        // Pull one produced packet and copy it into processing storage so
        // the producer's pool is released immediately.
        let producer_queue = self.producers[0].queue.ok_or(Error::NotInit)?;
        let producer_node = match self.bank.dequeue(producer_queue) {
            Some(node) => node,
            None => return Ok(Some(Warning::NoSamplesToProcess)),
        };
        let processing_queue = self.processing_queue.ok_or(Error::NotInit)?;
        let input_node = match self.bank.get_free_node(processing_queue) {
            Some(node) => node,
            None => {
                self.bank.free_node(producer_node);
                return Ok(Some(Warning::ProcessingQueueEmpty));
            }
        };
        let data_len = self.bank.data(producer_node).len();
        if !self.bank.copy_node(input_node, producer_node, data_len) {
            self.bank.free_node(producer_node);
            self.bank.free_node(input_node);
            return Err(Error::NodeDataSizeTooSmall);
        }
        self.bank.free_node(producer_node);

        let mut header = self.node_header(input_node);

        // A corrupt encapsulated header gets clamped to safe values so
        // the packet cannot overflow downstream copies.
        if self.producers[0].cfg.use_encapsulation {
            if header.crc_is_valid() {
                self.bank
                    .set_payload_size(input_node, u16::from(header.payload_size));
            } else {
                header.fallback = false;
                header.tx_queue_level_high = false;
                header.crc4 = 0;
                header.reserved = 0;
                header.payload_size = self.producers[0].cfg.audio_payload_size as u8;
                self.bank
                    .set_payload_size(input_node, self.producers[0].cfg.audio_payload_size);
                self.stats.producer_packets_corrupted_count += 1;
            }
            self.write_node_header(input_node, header);
        }

        self.finish_process(input_node, header)
    }

    /// Process a packet whose payload originates outside the producer
    /// queue (mixer output pipelines).
    pub(crate) fn process_from_buffer(&mut self, payload: &[u8]) -> PipelineResult {
        if !self.is_setup {
            return Err(Error::NotInit);
        }
        let processing_queue = self.processing_queue.ok_or(Error::NotInit)?;
        let input_node = match self.bank.get_free_node(processing_queue) {
            Some(node) => node,
            None => return Ok(Some(Warning::ProcessingQueueEmpty)),
        };

        let data = self.bank.data_mut(input_node);
        if data.len() < AUDIO_HEADER_SIZE + payload.len() {
            self.bank.free_node(input_node);
            return Err(Error::NodeDataSizeTooSmall);
        }
        data[..AUDIO_HEADER_SIZE].fill(0);
        data[AUDIO_HEADER_SIZE..AUDIO_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        self.bank.set_payload_size(input_node, payload.len() as u16);

        let header = AudioHeader {
            payload_size: payload.len() as u8,
            ..Default::default()
        };
        let result = self.finish_process(input_node, header);

        // The mixer output consumer starts with the first mixed packet
        // and is never stopped afterwards.
        if !self.consumers[0].buffering_complete {
            self.consumers[0].buffering_complete = true;
            self.consumers[0].ops.start();
        }

        result
    }

    /// Consume from every ready consumer endpoint.
    pub(crate) fn consume(&mut self) -> PipelineResult {
        if !self.is_setup {
            return Err(Error::NotInit);
        }

        if self.consumers[0].cfg.delayed_action {
            self.consume_delayed(0)
        } else {
            let mut warning = None;
            for index in 0..self.consumers.len() {
                if self.consumers[index]
                    .queue
                    .is_some_and(|q| !self.bank.is_empty(q))
                {
                    warning = self.consume_immediate(index)?.or(warning);
                }
            }
            Ok(warning)
        }
    }

    fn finish_process(&mut self, input_node: NodeId, mut header: AudioHeader) -> PipelineResult {
        let output_node = match self.run_chain(input_node, &mut header)? {
            Ok(node) => node,
            Err(warning) => return Ok(Some(warning)),
        };

        let warning = self.move_packet_to_consumers(output_node);
        self.bank.free_node(output_node);
        warning
    }

    fn check_buffering(&mut self) {
        // Mixing pipelines must not buffer ahead of the mixing stage.
        if self.cfg.mixer_option.input_mixer_pipeline || self.cfg.mixer_option.output_mixer_pipeline
        {
            return;
        }
        let threshold = u16::from(self.buffering_threshold);
        for consumer in &mut self.consumers {
            if !consumer.buffering_complete
                && consumer
                    .queue
                    .is_some_and(|q| self.bank.len(q) >= threshold)
            {
                consumer.buffering_complete = true;
                consumer.ops.start();
            }
        }
    }

    /// Walk the processing chain, ping-ponging between the two processing
    /// nodes. On success returns the node holding the final payload.
    fn run_chain(
        &mut self,
        mut input_node: NodeId,
        header: &mut AudioHeader,
    ) -> Result<core::result::Result<NodeId, Warning>> {
        let processing_queue = self.processing_queue.ok_or(Error::NotInit)?;

        for index in 0..self.chain.len() {
            let gate = self.chain[index].gate;
            let gate_closed = self.chain[index].gate_closed;
            let gate_open = match gate {
                None => true,
                Some(Gate::FallbackOn) => self.fallback_active,
                Some(Gate::FallbackOff) => !self.fallback_active,
            };
            let discard = !gate_open && gate_closed == GateClosedBehavior::Discard;
            if !gate_open && !discard {
                continue;
            }

            let output_node = match self.bank.get_free_node(processing_queue) {
                Some(node) => node,
                None => {
                    self.bank.free_node(input_node);
                    return Ok(Err(Warning::ProcessingQueueEmpty));
                }
            };

            let payload_len = usize::from(self.bank.payload_size(input_node));
            let consumer_cfg = self.consumers[0].cfg;
            let consumer_queue = self.consumers[0].queue;
            let mut ctx = StageCtx {
                consumer_cfg,
                consumer_queue_len: consumer_queue.map_or(0, |q| self.bank.len(q)),
                consumer_queue_limit: consumer_queue.map_or(0, |q| self.bank.limit(q)),
                consumer_buffering_complete: self.consumers[0].buffering_complete,
                samples_buffered_size: self.samples_buffered_size,
                stats: &mut self.stats,
                fallback_active: &mut self.fallback_active,
            };

            let (input_data, output_data) = self.bank.data_pair_mut(input_node, output_node);
            let input_payload = &input_data[AUDIO_HEADER_SIZE..AUDIO_HEADER_SIZE + payload_len];
            let output_payload = &mut output_data[AUDIO_HEADER_SIZE..];

            let stage = self.chain[index].stage_mut();
            let outcome = if discard {
                stage.process_discard(&mut ctx, header, input_payload, output_payload)
            } else {
                stage.process(&mut ctx, header, input_payload, output_payload)
            };

            match outcome {
                Ok(0) => {
                    // Nothing written: keep the input node as-is.
                    self.bank.free_node(output_node);
                }
                Ok(written) => {
                    self.bank.set_payload_size(output_node, written);
                    self.bank.free_node(input_node);
                    input_node = output_node;
                }
                Err(error) => {
                    self.bank.free_node(input_node);
                    self.bank.free_node(output_node);
                    return Err(error);
                }
            }
        }

        self.write_node_header(input_node, *header);
        Ok(Ok(input_node))
    }

    /// Copy the processed packet into a consumer node and enqueue it to
    /// every consumer, dropping the oldest packet on overflow.
    fn move_packet_to_consumers(&mut self, processing_node: NodeId) -> PipelineResult {
        for index in 0..self.consumers.len() {
            if self.is_consumer_overflowing(index) {
                self.stats.consumer_buffer_overflow_count += 1;
                let queue = self.consumers[index].queue.ok_or(Error::NotInit)?;
                if let Some(dropped) = self.bank.dequeue(queue) {
                    let payload = u32::from(self.bank.payload_size(dropped));
                    self.adjust_samples_buffered(-(i64::from(payload)));
                    self.bank.free_node(dropped);
                }
            }
        }

        let free_queue = self.consumers[0].free_queue.ok_or(Error::NotInit)?;
        let consumer_node = self
            .bank
            .get_free_node(free_queue)
            .ok_or(Error::NoFreeNode)?;
        let copy_len =
            AUDIO_HEADER_SIZE + usize::from(self.bank.payload_size(processing_node));
        if !self.bank.copy_node(consumer_node, processing_node, copy_len) {
            self.bank.free_node(consumer_node);
            return Err(Error::NodeDataSizeTooSmall);
        }

        for index in 0..self.consumers.len() {
            let queue = self.consumers[index].queue.ok_or(Error::NotInit)?;
            self.bank.enqueue(queue, consumer_node);
            let payload = u32::from(self.bank.payload_size(consumer_node));
            self.adjust_samples_buffered(i64::from(payload));
        }

        let length = u32::from(self.consumer_queue_len());
        if length > self.stats.consumer_queue_peak_buffer_load {
            self.stats.consumer_queue_peak_buffer_load = length;
        }

        Ok(None)
    }

    fn is_consumer_overflowing(&self, index: usize) -> bool {
        let consumer = &self.consumers[index];
        let (Some(queue), Some(free_queue)) = (consumer.queue, consumer.free_queue) else {
            return false;
        };
        if self.bank.len(queue) < self.bank.limit(queue) {
            return false;
        }
        if consumer.cfg.delayed_action {
            // One node must stay available for the delayed consumption.
            if consumer.current_node.is_none() {
                self.bank.len(free_queue) <= 1
            } else {
                self.bank.is_empty(free_queue)
            }
        } else {
            self.bank.is_empty(free_queue)
        }
    }

    /// Get a free node and hand it to the producer endpoint action.
    fn produce_action(&mut self) -> (usize, Option<Warning>) {
        let free_queue = match self.producers[0].free_queue {
            Some(queue) => queue,
            None => return (0, Some(Warning::ProducerQueueFull)),
        };
        let node = match self.bank.get_free_node(free_queue) {
            Some(node) => node,
            None => {
                self.stats.producer_buffer_overflow_count += 1;
                return (0, Some(Warning::ProducerQueueFull));
            }
        };
        self.producers[0].current_node = Some(node);

        let payload_size = usize::from(self.producers[0].cfg.audio_payload_size);
        let use_encapsulation = self.producers[0].cfg.use_encapsulation;
        if !use_encapsulation {
            self.bank.set_payload_size(node, payload_size as u16);
        }

        let data = self.bank.data_mut(node);
        let buffer = if use_encapsulation {
            &mut data[..AUDIO_HEADER_SIZE + payload_size]
        } else {
            &mut data[AUDIO_HEADER_SIZE..AUDIO_HEADER_SIZE + payload_size]
        };
        let size = self.producers[0].ops.produce(buffer);
        (size, None)
    }

    /// Enqueue the producer's current node into every producer queue,
    /// head-dropping on overflow.
    fn enqueue_producer_node(&mut self) -> Option<Warning> {
        let node = match self.producers[0].current_node.take() {
            Some(node) => node,
            None => return None,
        };
        let mut warning = None;

        if self.producers[0].cfg.use_encapsulation {
            // Adopt the payload size the producer wrote into the header.
            let header = self.node_header(node);
            self.bank
                .set_payload_size(node, u16::from(header.payload_size));
        }

        for index in 0..self.producers.len() {
            let Some(queue) = self.producers[index].queue else {
                continue;
            };
            if self.bank.len(queue) >= self.bank.limit(queue) {
                // Drop the oldest packet to make room for new ones.
                warning = Some(Warning::ProducerQueueFull);
                self.stats.producer_buffer_overflow_count += 1;
                if let Some(dropped) = self.bank.dequeue(queue) {
                    self.bank.free_node(dropped);
                }
            }
        }

        for index in 0..self.producers.len() {
            if let Some(queue) = self.producers[index].queue {
                self.bank.enqueue(queue, node);
            }
        }

        warning
    }

    fn consume_immediate(&mut self, index: usize) -> PipelineResult {
        if !self.consumers[index].buffering_complete {
            return Ok(Some(Warning::BufferingNotComplete));
        }

        let queue = self.consumers[index].queue.ok_or(Error::NotInit)?;
        self.consumers[index].current_node = self.bank.peek(queue);
        let underflowed = self.consumers[index].current_node.is_none();
        let size = self.consume_action(index)?;
        if size > 0 {
            // Consumed successfully, so dequeue and free.
            if let Some(node) = self.bank.dequeue(queue) {
                let payload = u32::from(self.bank.payload_size(node));
                self.adjust_samples_buffered(-(i64::from(payload)));
                self.bank.free_node(node);
            }
        }
        self.consumers[index].current_node = None;
        Ok(underflowed.then_some(Warning::ConsumerQueueEmpty))
    }

    fn consume_delayed(&mut self, index: usize) -> PipelineResult {
        if !self.consumers[index].buffering_complete {
            return Ok(Some(Warning::BufferingNotComplete));
        }

        if let Some(previous) = self.consumers[index].current_node.take() {
            self.bank.free_node(previous);
        }
        let queue = self.consumers[index].queue.ok_or(Error::NotInit)?;
        self.consumers[index].current_node = self.bank.dequeue(queue);
        if let Some(node) = self.consumers[index].current_node {
            let payload = u32::from(self.bank.payload_size(node));
            self.adjust_samples_buffered(-(i64::from(payload)));
        }

        let size = self.consume_action(index)?;
        Ok(if size == 0 && self.consumers[index].current_node.is_none() {
            Some(Warning::ConsumerQueueEmpty)
        } else {
            None
        })
    }

    /// Apply the consumer endpoint action to its current node. A missing
    /// node is an underflow: counted, and the consumer re-buffers.
    fn consume_action(&mut self, index: usize) -> Result<usize> {
        let node = match self.consumers[index].current_node {
            Some(node) => node,
            None => {
                self.stats.consumer_buffer_underflow_count += 1;
                self.consumers[index].buffering_complete = false;
                return Ok(0);
            }
        };

        let payload_size = usize::from(self.bank.payload_size(node));
        if self.consumers[index].cfg.use_encapsulation {
            let queue = self.consumers[index].queue.ok_or(Error::NotInit)?;
            let mut header = self.node_header(node);
            header.payload_size = payload_size as u8;
            header.tx_queue_level_high = self.bank.len(queue) >= TX_QUEUE_HIGH_LEVEL;
            header.fallback = self.fallback_active;
            header.finalize_crc();
            self.write_node_header(node, header);

            let data = self.bank.data(node);
            let packet = &data[..AUDIO_HEADER_SIZE + payload_size];
            Ok(self.consumers[index].ops.consume(packet))
        } else {
            let data = self.bank.data(node);
            let payload = &data[AUDIO_HEADER_SIZE..AUDIO_HEADER_SIZE + payload_size];
            Ok(self.consumers[index].ops.consume(payload))
        }
    }

    /// Dequeue one packet from the consumer queue for mixing; the caller
    /// copies the payload and must free the node.
    pub(crate) fn pop_mix_packet(&mut self) -> Option<NodeId> {
        let queue = self.consumers[0].queue?;
        self.bank.dequeue(queue)
    }

    /// Payload bytes of a node, header excluded.
    pub(crate) fn node_payload_bytes(&self, node: NodeId) -> &[u8] {
        let payload_size = usize::from(self.bank.payload_size(node));
        &self.bank.data(node)[AUDIO_HEADER_SIZE..AUDIO_HEADER_SIZE + payload_size]
    }

    /// Return a mixing node to its free pool.
    pub(crate) fn free_mix_packet(&mut self, node: NodeId) {
        self.bank.free_node(node);
    }

    /// Adjust the buffered byte count from outside (mixer silence fill).
    pub(crate) fn add_samples_buffered(&mut self, bytes: u32) {
        (self.critical.enter)();
        self.samples_buffered_size = self.samples_buffered_size.saturating_add(bytes);
        (self.critical.exit)();
    }

    pub(crate) fn apply_samples_delta(&mut self, delta: i64) {
        (self.critical.enter)();
        let updated = i64::from(self.samples_buffered_size) + delta;
        self.samples_buffered_size = updated.max(0) as u32;
        (self.critical.exit)();
    }

    pub(crate) fn take_mixer_delta(&mut self) -> i64 {
        core::mem::take(&mut self.mixer_delta)
    }

    fn adjust_samples_buffered(&mut self, delta: i64) {
        if self.cfg.mixer_option.output_mixer_pipeline && delta < 0 {
            // Drops and consumption on a mixing pipeline account against
            // its input pipelines; the core applies the delta after the
            // call.
            self.mixer_delta += delta;
            return;
        }
        (self.critical.enter)();
        let updated = i64::from(self.samples_buffered_size) + delta;
        self.samples_buffered_size = updated.max(0) as u32;
        (self.critical.exit)();
    }

    fn node_header(&self, node: NodeId) -> AudioHeader {
        let data = self.bank.data(node);
        AudioHeader::from_bytes([data[0], data[1]])
    }

    fn write_node_header(&mut self, node: NodeId, header: AudioHeader) {
        let bytes = header.to_bytes();
        self.bank.data_mut(node)[..AUDIO_HEADER_SIZE].copy_from_slice(&bytes);
    }

    fn init_audio_queues(&mut self, pool: &mut MemPool) -> Result<()> {
        let inflation =
            PAYLOAD_SIZE_VAR_SIZE + AUDIO_HEADER_SIZE as u16 + CDC_QUEUE_DATA_SIZE_INFLATION;

        // Processing nodes must fit whichever side is larger.
        let max_payload = self.producers[0]
            .cfg
            .audio_payload_size
            .max(self.consumers[0].cfg.audio_payload_size);
        let processing_data_size = align4(max_payload + inflation);
        self.processing_queue = Some(
            self.bank
                .init_pool(
                    pool,
                    PROCESSING_NODE_COUNT,
                    processing_data_size,
                    "Processing Free Queue",
                )
                .ok_or(Error::NotEnoughMemory)?,
        );

        // Chained producers share the primary's free pool, so their
        // payloads must fit its nodes.
        for producer in &self.producers[1..] {
            if producer.cfg.audio_payload_size > self.producers[0].cfg.audio_payload_size {
                return Err(Error::PipelineCfgInvalid);
            }
        }

        let producer_data_size =
            align4(self.producers[0].cfg.audio_payload_size + inflation);
        if self.producers[0].cfg.queue_size < MIN_PRODUCER_QUEUE_SIZE {
            self.producers[0].cfg.queue_size = MIN_PRODUCER_QUEUE_SIZE;
        }
        let producer_queue_size = self.producers[0].cfg.queue_size;
        // The free pool is deeper so the produce action and the process
        // input copy can always succeed.
        let producer_free_size = u16::from(producer_queue_size)
            + u16::from(EP_ACTION_NODE_COUNT)
            + u16::from(PROCESS_INPUT_NODE_COUNT);
        let producer_free_queue = self
            .bank
            .init_pool(
                pool,
                producer_free_size,
                producer_data_size,
                "Producer Free Queue",
            )
            .ok_or(Error::NotEnoughMemory)?;
        for producer in &mut self.producers {
            producer.free_queue = Some(producer_free_queue);
        }
        for index in 0..self.producers.len() {
            let queue = self
                .bank
                .init_queue(u16::from(producer_queue_size), "Producer Queue");
            self.producers[index].queue = Some(queue);
        }

        let consumer_queue_size = {
            let consumer = &self.consumers[0];
            if consumer.cfg.queue_size > u8::MAX - consumer.extra_queue_size {
                return Err(Error::MaximumReached);
            }
            consumer.cfg.queue_size + consumer.extra_queue_size
        };
        let consumer_data_size =
            align4(self.consumers[0].cfg.audio_payload_size + inflation);
        let mut consumer_free_size = u16::from(consumer_queue_size);
        if self.consumers[0].cfg.delayed_action {
            consumer_free_size += u16::from(EP_ACTION_NODE_COUNT);
        }
        let consumer_free_queue = self
            .bank
            .init_pool(
                pool,
                consumer_free_size,
                consumer_data_size,
                "Audio Buffer Free Queue",
            )
            .ok_or(Error::NotEnoughMemory)?;
        for consumer in &mut self.consumers {
            consumer.free_queue = Some(consumer_free_queue);
        }
        for index in 0..self.consumers.len() {
            let queue = self
                .bank
                .init_queue(u16::from(consumer_queue_size), "Audio Buffer");
            self.consumers[index].queue = Some(queue);
        }

        Ok(())
    }
}

#[inline]
fn align4(size: u16) -> u16 {
    size.div_ceil(4) * 4
}
