//! Audio mixer module.
//!
//! Mixes several input streams into one by per-sample averaging of 16-bit
//! samples. Each input owns an accumulation queue; the mixing pipeline
//! fills them from its input pipelines' consumer queues, padding with
//! silence when an input underruns, and drains one mixed payload per
//! process call. Leftover input bytes carry over to the next round.

use alloc::boxed::Box;
use alloc::vec::Vec;

use awl_core::MemPool;

use crate::error::{Error, Result};
use crate::format::BitDepth;

/// Fewest inputs a mixer can combine.
pub const MIN_MIXER_INPUTS: u8 = 2;

/// Most inputs a mixer can combine.
pub const MAX_MIXER_INPUTS: u8 = 3;

/// Smallest mixable payload in bytes.
const MIN_PAYLOAD_SIZE: u16 = 2;

/// Largest mixable payload in bytes.
const MAX_PAYLOAD_SIZE: u16 = 240;

/// Mixer configuration.
#[derive(Debug, Clone, Copy)]
pub struct MixerCfg {
    /// Number of input streams.
    pub nb_of_inputs: u8,
    /// Payload size of the mixed output in bytes.
    pub payload_size: u16,
    /// Sample bit depth; only 16-bit mixing is supported.
    pub bit_depth: BitDepth,
}

struct MixerQueue {
    samples: Box<[u8]>,
    current_size: u16,
}

/// N-input averaging mixer.
pub struct MixerModule {
    /// Mixer configuration.
    pub cfg: MixerCfg,
    input_queues: Vec<MixerQueue>,
    output_packet: Box<[u8]>,
}

impl MixerModule {
    /// Create a mixer, drawing its buffers from the memory pool.
    pub fn new(cfg: MixerCfg, pool: &mut MemPool) -> Result<Self> {
        if cfg.nb_of_inputs < MIN_MIXER_INPUTS || cfg.nb_of_inputs > MAX_MIXER_INPUTS {
            return Err(Error::MixerInitFailure);
        }
        if cfg.bit_depth != BitDepth::Bits16 {
            return Err(Error::MixerInitFailure);
        }
        if cfg.payload_size < MIN_PAYLOAD_SIZE || cfg.payload_size > MAX_PAYLOAD_SIZE {
            return Err(Error::MixerInitFailure);
        }

        let mut input_queues = Vec::with_capacity(usize::from(cfg.nb_of_inputs));
        for _ in 0..cfg.nb_of_inputs {
            // Room for a full payload plus a carried remainder.
            let samples = pool
                .alloc_bytes(usize::from(cfg.payload_size) * 2)
                .ok_or(Error::NotEnoughMemory)?;
            input_queues.push(MixerQueue {
                samples,
                current_size: 0,
            });
        }
        let output_packet = pool
            .alloc_bytes(usize::from(cfg.payload_size))
            .ok_or(Error::NotEnoughMemory)?;

        Ok(Self {
            cfg,
            input_queues,
            output_packet,
        })
    }

    /// Bytes currently accumulated for one input.
    pub fn input_len(&self, input: usize) -> u16 {
        self.input_queues[input].current_size
    }

    /// Append payload bytes to an input's accumulation queue.
    pub fn append_samples(&mut self, input: usize, samples: &[u8]) {
        let queue = &mut self.input_queues[input];
        let offset = usize::from(queue.current_size);
        let len = samples.len().min(queue.samples.len() - offset);
        queue.samples[offset..offset + len].copy_from_slice(&samples[..len]);
        queue.current_size += len as u16;
    }

    /// Append silence to an input's accumulation queue.
    pub fn append_silence(&mut self, input: usize, size: u16) {
        let queue = &mut self.input_queues[input];
        let offset = usize::from(queue.current_size);
        let len = usize::from(size).min(queue.samples.len() - offset);
        queue.samples[offset..offset + len].fill(0);
        queue.current_size += len as u16;
    }

    /// Mix one payload from every input queue into the output packet and
    /// carry the remainders over.
    pub fn mix_packets(&mut self) {
        self.mix_i16();
        self.handle_remainder();
    }

    /// The last mixed payload.
    pub fn output_packet(&self) -> &[u8] {
        &self.output_packet
    }

    fn mix_i16(&mut self) {
        let sample_count = usize::from(self.cfg.payload_size) / 2;
        let nb_of_inputs = i32::from(self.cfg.nb_of_inputs);

        for sample in 0..sample_count {
            let mut sum: i32 = 0;
            for queue in &self.input_queues {
                let offset = sample * 2;
                sum += i32::from(i16::from_le_bytes([
                    queue.samples[offset],
                    queue.samples[offset + 1],
                ]));
            }
            let mixed = (sum / nb_of_inputs) as i16;
            self.output_packet[sample * 2..sample * 2 + 2].copy_from_slice(&mixed.to_le_bytes());
        }
    }

    fn handle_remainder(&mut self) {
        let payload = usize::from(self.cfg.payload_size);
        for queue in &mut self.input_queues {
            let current = usize::from(queue.current_size);
            let remainder = current.saturating_sub(payload);
            if remainder > 0 {
                queue.samples.copy_within(payload..payload + remainder, 0);
            }
            queue.current_size = remainder as u16;
        }
    }
}
