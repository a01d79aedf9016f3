//! Errors and warnings for the streaming core.
//!
//! Two disjoint result lanes: [`Error`] is fatal to the operation that
//! raised it and propagates to the caller; [`Warning`] is advisory, the
//! operation continued in a degraded way and the condition is reported
//! alongside the successful return.

use core::fmt;

/// Fatal error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The memory pool budget cannot cover an initialization request.
    NotEnoughMemory,
    /// A processing stage rejected its configuration at init time.
    ProcessingStageInit,
    /// The pipeline configuration is invalid.
    PipelineCfgInvalid,
    /// The mixer module rejected its configuration.
    MixerInitFailure,
    /// A counter or list reached its maximum.
    MaximumReached,
    /// A processing stage control was called with an unknown command.
    InvalidCmd,
    /// The fallback stage rejected its configuration at init time.
    FallbackInitFailure,
    /// The configured bit depth is not supported.
    BitDepth,
    /// The configured channel count is not supported.
    ChannelCount,
    /// The mixer options are contradictory.
    MixerOption,
    /// A processing stage control was called with an invalid argument.
    InvalidArg,
    /// A node is too small for the data to be copied into it.
    NodeDataSizeTooSmall,
    /// The core has not been initialized yet.
    NotInit,
    /// A gate references a fallback stage that is not in the chain.
    FallbackProcNotFound,
    /// A processing stage received a packet of unexpected size.
    InvalidPacketSize,
    /// No free node was available where one is required.
    NoFreeNode,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotEnoughMemory => write!(f, "not enough memory"),
            Error::ProcessingStageInit => write!(f, "processing stage initialization failed"),
            Error::PipelineCfgInvalid => write!(f, "invalid pipeline configuration"),
            Error::MixerInitFailure => write!(f, "mixer initialization failed"),
            Error::MaximumReached => write!(f, "maximum reached"),
            Error::InvalidCmd => write!(f, "invalid command"),
            Error::FallbackInitFailure => write!(f, "fallback initialization failed"),
            Error::BitDepth => write!(f, "invalid bit depth"),
            Error::ChannelCount => write!(f, "invalid channel count"),
            Error::MixerOption => write!(f, "invalid mixer option"),
            Error::InvalidArg => write!(f, "invalid argument"),
            Error::NodeDataSizeTooSmall => write!(f, "node data size too small"),
            Error::NotInit => write!(f, "not initialized"),
            Error::FallbackProcNotFound => write!(f, "fallback processing stage not found"),
            Error::InvalidPacketSize => write!(f, "invalid packet size"),
            Error::NoFreeNode => write!(f, "no free node available"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Advisory conditions raised while an operation continued degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    /// The producer queue was full; the oldest packet was dropped.
    ProducerQueueFull,
    /// The consumer queue was empty; the consumer re-enters buffering.
    ConsumerQueueEmpty,
    /// Initial buffering has not completed yet.
    BufferingNotComplete,
    /// The producer queue held no packet to process.
    NoSamplesToProcess,
    /// The processing node pool was exhausted.
    ProcessingQueueEmpty,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ProducerQueueFull => write!(f, "producer queue full"),
            Warning::ConsumerQueueEmpty => write!(f, "consumer queue empty"),
            Warning::BufferingNotComplete => write!(f, "buffering not complete"),
            Warning::NoSamplesToProcess => write!(f, "no samples to process"),
            Warning::ProcessingQueueEmpty => write!(f, "processing queue empty"),
        }
    }
}

/// Result type alias for streaming core operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Result of a pipeline entry point: fatal errors in the `Err` lane,
/// advisory warnings in the `Ok` lane.
pub type PipelineResult = Result<Option<Warning>>;
