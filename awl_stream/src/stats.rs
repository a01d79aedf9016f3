//! Pipeline statistics.
//!
//! Advisory counters updated by the pipeline runtime. Writers use plain
//! 32-bit stores; readers in other contexts may observe torn values, which
//! is acceptable for diagnostics.

use core::fmt;

/// Per-pipeline statistics.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PipelineStats {
    /// Audio packets currently in the producer queue.
    pub producer_buffer_load: u32,
    /// Maximum packets the producer queue can hold.
    pub producer_buffer_size: u16,
    /// Times the producer queue overflowed.
    pub producer_buffer_overflow_count: u32,
    /// Corrupted packets received from the producer.
    pub producer_packets_corrupted_count: u32,
    /// Audio packets currently in the consumer queue.
    pub consumer_buffer_load: u32,
    /// Maximum packets the consumer queue can hold.
    pub consumer_buffer_size: u16,
    /// Times the consumer queue overflowed.
    pub consumer_buffer_overflow_count: u32,
    /// Times the consumer queue underflowed.
    pub consumer_buffer_underflow_count: u32,
    /// Consumer queue peak load.
    pub consumer_queue_peak_buffer_load: u32,
}

impl PipelineStats {
    /// Clear every counter, preserving the configured buffer sizes.
    pub fn reset(&mut self) {
        let producer_size = self.producer_buffer_size;
        let consumer_size = self.consumer_buffer_size;
        *self = Self::default();
        self.producer_buffer_size = producer_size;
        self.consumer_buffer_size = consumer_size;
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Producer")?;
        writeln!(f, "  Buffer Load:            {:10}", self.producer_buffer_load)?;
        writeln!(f, "  Buffer Size:            {:10}", self.producer_buffer_size)?;
        writeln!(
            f,
            "  Corrupted Packets Count:{:10}",
            self.producer_packets_corrupted_count
        )?;
        writeln!(f, "Consumer")?;
        writeln!(f, "  Buffer Load:            {:10}", self.consumer_buffer_load)?;
        writeln!(f, "  Buffer Size:            {:10}", self.consumer_buffer_size)?;
        writeln!(
            f,
            "  Producer Overflow Count:{:10}",
            self.producer_buffer_overflow_count
        )?;
        writeln!(
            f,
            "  Buffer Overflow Count:  {:10}",
            self.consumer_buffer_overflow_count
        )?;
        writeln!(
            f,
            "  Buffer Underflow Count: {:10}",
            self.consumer_buffer_underflow_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_preserves_sizes() {
        let mut stats = PipelineStats {
            producer_buffer_size: 3,
            consumer_buffer_size: 11,
            consumer_buffer_underflow_count: 7,
            producer_buffer_overflow_count: 2,
            ..Default::default()
        };
        stats.reset();
        assert_eq!(stats.producer_buffer_size, 3);
        assert_eq!(stats.consumer_buffer_size, 11);
        assert_eq!(stats.consumer_buffer_underflow_count, 0);
        assert_eq!(stats.producer_buffer_overflow_count, 0);
    }

    #[test]
    fn test_display_contains_counters() {
        let stats = PipelineStats {
            consumer_buffer_underflow_count: 5,
            ..Default::default()
        };
        let rendered = alloc::format!("{stats}");
        assert!(rendered.contains("Underflow"));
        assert!(rendered.contains('5'));
    }
}
