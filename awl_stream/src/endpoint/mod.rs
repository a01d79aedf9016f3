//! Pipeline endpoints.
//!
//! An endpoint ties one end of a pipeline to platform I/O: a codec driver,
//! the wireless transport, or a test source. The platform side implements
//! [`EndpointOps`]; the pipeline owns the queues, the current node and the
//! buffering state.
//!
//! Two action styles exist. An *immediate* endpoint moves bytes inside the
//! call and returns the count (zero means failure or no data). A
//! *delayed-action* endpoint starts an asynchronous transfer (typically
//! DMA) and returns zero; on completion the platform calls back into the
//! pipeline (`pipeline_produce` / `pipeline_consume`) to hand over the
//! finished node and start the next transfer.

pub mod dummy;
pub mod sine;

use alloc::boxed::Box;

use awl_core::{NodeId, QueueId};

use crate::error::{Error, Result};
use crate::format::MAX_CHANNEL_COUNT;

/// Platform I/O operations backing an endpoint.
///
/// A producer overrides [`produce`](Self::produce), a consumer
/// [`consume`](Self::consume); the defaults report no data so one type can
/// implement a single direction.
pub trait EndpointOps {
    /// Fill `buffer` with produced audio. Returns bytes produced, or zero
    /// for failure / delayed completion.
    fn produce(&mut self, buffer: &mut [u8]) -> usize {
        let _ = buffer;
        0
    }

    /// Consume the audio in `buffer`. Returns bytes consumed, or zero for
    /// failure / delayed completion.
    fn consume(&mut self, buffer: &[u8]) -> usize {
        let _ = buffer;
        0
    }

    /// Startup sequence, called when the pipeline starts this endpoint.
    fn start(&mut self) {}

    /// Stop all endpoint operations.
    fn stop(&mut self) {}
}

/// Endpoint configuration.
#[derive(Debug, Clone, Copy)]
pub struct EndpointCfg {
    /// True when the endpoint moves audio packets (header + payload),
    /// false for bare payloads.
    pub use_encapsulation: bool,
    /// True when the endpoint needs a complete cycle to produce or consume.
    pub delayed_action: bool,
    /// 1 for mono payloads, 2 for interleaved stereo.
    pub channel_count: u8,
    /// Audio payload size in bytes.
    pub audio_payload_size: u16,
    /// Endpoint queue depth in packets.
    pub queue_size: u8,
}

/// One end of a pipeline: platform ops plus queue bindings.
pub struct Endpoint {
    /// Endpoint name, used for queue naming and diagnostics.
    pub name: &'static str,
    /// Endpoint configuration.
    pub cfg: EndpointCfg,
    pub(crate) ops: Box<dyn EndpointOps>,
    pub(crate) queue: Option<QueueId>,
    pub(crate) free_queue: Option<QueueId>,
    pub(crate) current_node: Option<NodeId>,
    pub(crate) buffering_complete: bool,
    pub(crate) extra_queue_size: u8,
}

impl Endpoint {
    /// Create an endpoint from platform ops and a configuration.
    pub fn new(name: &'static str, ops: Box<dyn EndpointOps>, cfg: EndpointCfg) -> Result<Self> {
        if cfg.channel_count == 0 || cfg.channel_count > MAX_CHANNEL_COUNT {
            return Err(Error::ChannelCount);
        }
        Ok(Self {
            name,
            cfg,
            ops,
            queue: None,
            free_queue: None,
            current_node: None,
            buffering_complete: false,
            extra_queue_size: 0,
        })
    }

    /// Whether initial buffering has completed.
    #[inline]
    pub fn buffering_complete(&self) -> bool {
        self.buffering_complete
    }

    /// Extra queue depth requested by processing stages.
    #[inline]
    pub fn extra_queue_size(&self) -> u8 {
        self.extra_queue_size
    }
}
