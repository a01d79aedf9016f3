//! Link-quality fallback controller.
//!
//! Decides when the link can no longer carry the full-quality stream and
//! flips a single boolean mode that gates branches of the processing chain
//! (e.g. ADPCM compression instead of plain packing). The transmitter runs
//! the state machine from three inputs: the rolling consumer queue-length
//! average, the received link-margin average and the wireless layer's CCA
//! fail counters. The receiver simply mirrors the bit carried in every
//! audio header.
//!
//! State machine on the transmitter:
//!
//! ```text
//! NORMAL ──queue threshold / CCA bad──▶ WAIT_THRESHOLD ──lm avg valid──▶ FALLBACK
//!   ▲  ▲                                     │                             │
//!   │  └──────link good long enough──────────┼─────────────────────────────┘
//!   │                                        ▼
//!   └──────link good long enough──── FALLBACK_DISCONNECT ◀──queue full────┘
//! ```
//!
//! Startup is FALLBACK_DISCONNECT with the flag raised; the first good-link
//! interval lifts it. While in WAIT_THRESHOLD the measured link margin
//! becomes the return-to-normal threshold, clamped to the configured
//! default ± hysteresis.

use alloc::boxed::Box;

use crate::error::{Error, Result};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Decimal factor for queue length tenths.
const BUF_SIZE_DECIMAL_FACTOR: u32 = 10;

/// Link statistics sampling frequency in Hertz.
const SAMPLING_FREQ_HZ: u32 = 10;

/// Decimal factor for CCA fail count averages.
const CCA_DECIMAL_FACTOR: u32 = 100;

/// Slots in the consumer queue-length rolling average.
const QUEUE_ARRAY_LENGTH: usize = 3;

/// Snapshot of the wireless layer's CCA counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WirelessFallbackInfo {
    /// Total clear-channel assessment failures.
    pub cca_fail_count: u32,
    /// Total clear-channel assessment events.
    pub cca_event_count: u32,
}

/// Access to wireless-layer statistics.
pub trait WirelessMonitor {
    /// Snapshot the CCA counters.
    fn fallback_info(&mut self) -> WirelessFallbackInfo;
}

/// Fallback state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FallbackState {
    /// Monitoring the TX buffer for degradation.
    Normal,
    /// Link degrading; measuring the return-to-normal threshold.
    WaitThreshold,
    /// Degraded link.
    Fallback,
    /// Disconnected link.
    FallbackDisconnect,
}

/// Fallback configuration.
#[derive(Debug, Clone, Copy)]
pub struct FallbackCfg {
    /// True on the audio transmitting device.
    pub is_tx_device: bool,
    /// Default link margin threshold to leave fallback.
    pub link_margin_threshold: u8,
    /// Hysteresis around the link margin threshold.
    pub link_margin_threshold_hysteresis: u8,
    /// Seconds the link margin must stay good to leave fallback.
    pub link_margin_good_time_sec: u32,
    /// Maximum CCA tries possible on the connection.
    pub cca_max_try_count: u16,
    /// CCA try threshold in percent of the maximum.
    pub cca_try_count_threshold_perc: u8,
    /// Seconds the CCA count must stay good to leave fallback.
    pub cca_good_time_sec: u32,
    /// Seconds the CCA count must stay bad to enter fallback.
    pub cca_bad_time_sec: f32,
    /// Consumer buffer load (×10) above which fallback triggers.
    pub consumer_buffer_load_threshold_tenths: u32,
    /// Host tick frequency in Hertz.
    pub tick_frequency_hz: u32,
}

impl Default for FallbackCfg {
    fn default() -> Self {
        Self {
            is_tx_device: false,
            link_margin_threshold: 50,
            link_margin_threshold_hysteresis: 20,
            link_margin_good_time_sec: 5,
            cca_max_try_count: 0,
            cca_try_count_threshold_perc: 5,
            cca_good_time_sec: 30,
            cca_bad_time_sec: 0.1,
            // Average consumer buffer load of 1.3.
            consumer_buffer_load_threshold_tenths: 13,
            tick_frequency_hz: 0,
        }
    }
}

/// Consumer queue metrics.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FallbackQueueMetrics {
    queue_length_arr: [u8; QUEUE_ARRAY_LENGTH],
    queue_length_arr_idx: u8,
    queue_length_sum: u16,
    /// Queue length rolling average, in tenths of a packet.
    pub queue_length_avg_tenths: u32,
}

/// Link margin metrics.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FallbackLinkMarginMetrics {
    /// Current threshold to return to normal.
    pub threshold: u8,
    /// Configured default threshold.
    pub threshold_default: u8,
    /// Threshold hysteresis.
    pub threshold_hysteresis: u8,
    /// Link margin values accumulated this sampling period.
    pub accumulator: u32,
    /// Number of values accumulated.
    pub accumulator_count: u16,
    /// Average of the last completed sampling period.
    pub accumulator_average: u8,
    /// Consecutive good sampling periods.
    pub good_count: u16,
    /// Good periods required to leave fallback.
    pub good_count_threshold: u16,
    /// Minimum link margin observed since the last peak reset.
    pub consumer_link_margin_min_peak: u8,
}

/// CCA metrics.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FallbackCcaMetrics {
    /// Event count at the start of the averaging period.
    pub cca_event_count_start: u32,
    /// Current event count.
    pub cca_event_count_current: u32,
    /// Events in the last sampling period.
    pub cca_event_count: u32,
    /// Allowed fail average, scaled by [`CCA_DECIMAL_FACTOR`].
    pub fail_count_threshold: u32,
    /// Fail count at the start of the averaging period.
    pub fail_count_start: u32,
    /// Current fail count.
    pub fail_count_current: u32,
    /// Fails in the last sampling period.
    pub fail_count: u32,
    /// Fail average in the last sampling period, scaled.
    pub fail_count_avg: u32,
    /// Consecutive good sampling periods.
    pub good_count: u16,
    /// Consecutive bad sampling periods.
    pub bad_count: u16,
    /// Good periods required to leave fallback.
    pub good_count_threshold: u16,
    /// Bad periods required to trigger fallback.
    pub bad_count_threshold: u16,
    /// Peak fail average since the last peak reset.
    pub consumer_cca_fail_count_peak: u32,
}

/// Link-quality fallback stage.
pub struct FallbackStage {
    /// Stage configuration.
    pub cfg: FallbackCfg,
    monitor: Box<dyn WirelessMonitor>,
    get_tick: fn() -> u32,
    state_change_callback: Option<fn(bool)>,
    state: FallbackState,
    fallback_flag: bool,
    manual_mode: bool,
    fallback_count: u32,
    consumer_buffer_size_tenths: u32,
    sampling_tick_start: u32,
    queue_metrics: FallbackQueueMetrics,
    link_margin_metrics: FallbackLinkMarginMetrics,
    cca_metrics: FallbackCcaMetrics,
}

impl FallbackStage {
    /// Create a fallback stage from its configuration, a wireless monitor
    /// and the host tick source.
    pub fn new(cfg: FallbackCfg, monitor: Box<dyn WirelessMonitor>, get_tick: fn() -> u32) -> Self {
        Self {
            cfg,
            monitor,
            get_tick,
            state_change_callback: None,
            state: FallbackState::FallbackDisconnect,
            fallback_flag: true,
            manual_mode: false,
            fallback_count: 0,
            consumer_buffer_size_tenths: 0,
            sampling_tick_start: 0,
            queue_metrics: FallbackQueueMetrics::default(),
            link_margin_metrics: FallbackLinkMarginMetrics::default(),
            cca_metrics: FallbackCcaMetrics::default(),
        }
    }

    /// Install a callback invoked on every fallback flag change.
    pub fn with_state_change_callback(mut self, callback: fn(bool)) -> Self {
        self.state_change_callback = Some(callback);
        self
    }

    pub(crate) fn init(&mut self, ctx: &mut StageInitCtx<'_>) -> Result<()> {
        // Start the system in fallback mode.
        self.fallback_flag = true;
        self.state = FallbackState::FallbackDisconnect;
        self.fallback_count = 0;

        if !self.cfg.is_tx_device {
            return Ok(());
        }

        if self.cfg.tick_frequency_hz == 0 {
            return Err(Error::FallbackInitFailure);
        }
        let consumer_buffer_size_tenths =
            u32::from(ctx.consumer_cfg.queue_size) * BUF_SIZE_DECIMAL_FACTOR;
        if self.cfg.consumer_buffer_load_threshold_tenths == 0
            || self.cfg.consumer_buffer_load_threshold_tenths >= consumer_buffer_size_tenths
            || consumer_buffer_size_tenths == 0
        {
            return Err(Error::FallbackInitFailure);
        }

        let lm = &mut self.link_margin_metrics;
        lm.good_count_threshold =
            (self.cfg.link_margin_good_time_sec * SAMPLING_FREQ_HZ) as u16;
        lm.threshold_default = self.cfg.link_margin_threshold;
        lm.threshold = self.cfg.link_margin_threshold;
        lm.threshold_hysteresis = self.cfg.link_margin_threshold_hysteresis;

        let cca = &mut self.cca_metrics;
        cca.good_count_threshold = (self.cfg.cca_good_time_sec * SAMPLING_FREQ_HZ) as u16;
        cca.bad_count_threshold =
            ((self.cfg.cca_bad_time_sec * SAMPLING_FREQ_HZ as f32) as u16).max(1);
        cca.fail_count_threshold =
            u32::from(self.cfg.cca_max_try_count) * u32::from(self.cfg.cca_try_count_threshold_perc);
        cca.good_count = cca.good_count_threshold;

        self.consumer_buffer_size_tenths = consumer_buffer_size_tenths;
        self.queue_metrics = FallbackQueueMetrics::default();
        self.init_link_stats();

        Ok(())
    }

    pub(crate) fn ctrl(&mut self, _cmd: u8, _arg: u32) -> Result<u32> {
        Err(Error::InvalidCmd)
    }

    pub(crate) fn process(
        &mut self,
        ctx: &mut StageCtx<'_>,
        header: &mut AudioHeader,
        _input: &[u8],
        _output: &mut [u8],
    ) -> Result<u16> {
        if self.cfg.is_tx_device {
            self.update_state(ctx);
            header.fallback = self.fallback_flag;
        } else if header.fallback {
            self.set_fallback_flag();
        } else {
            self.clear_fallback_flag();
        }

        *ctx.fallback_active = self.fallback_flag;
        Ok(0)
    }

    /// Whether the fallback mode is active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.fallback_flag
    }

    /// Current state machine state.
    #[inline]
    pub fn state(&self) -> FallbackState {
        self.state
    }

    /// Times the fallback mode has been activated.
    #[inline]
    pub fn fallback_count(&self) -> u32 {
        self.fallback_count
    }

    /// Raise the fallback flag.
    pub fn set_fallback_flag(&mut self) {
        if !self.fallback_flag {
            self.fallback_flag = true;
            self.fallback_count += 1;
            if let Some(callback) = self.state_change_callback {
                callback(true);
            }
        }
    }

    /// Clear the fallback flag.
    pub fn clear_fallback_flag(&mut self) {
        if self.fallback_flag {
            self.fallback_flag = false;
            if let Some(callback) = self.state_change_callback {
                callback(false);
            }
        }
    }

    /// Bypass the state machine; only explicit set/clear flip the flag.
    pub fn set_manual_mode(&mut self, enabled: bool) {
        self.manual_mode = enabled;
    }

    /// Feed one received link margin value (RX -> TX side channel).
    pub fn set_rx_link_margin(&mut self, rx_lm: u8) {
        let lm = &mut self.link_margin_metrics;
        lm.accumulator += u32::from(rx_lm);
        lm.accumulator_count += 1;
        if rx_lm < lm.consumer_link_margin_min_peak {
            lm.consumer_link_margin_min_peak = rx_lm;
        }
    }

    /// Link margin average over the last sampling period.
    pub fn rx_link_margin(&self) -> u8 {
        self.link_margin_metrics.accumulator_average
    }

    /// Link margin metrics.
    pub fn link_margin_metrics(&self) -> &FallbackLinkMarginMetrics {
        &self.link_margin_metrics
    }

    /// CCA metrics.
    pub fn cca_metrics(&self) -> &FallbackCcaMetrics {
        &self.cca_metrics
    }

    /// Consumer queue metrics.
    pub fn queue_metrics(&self) -> &FallbackQueueMetrics {
        &self.queue_metrics
    }

    /// Set the time the link margin must be good to leave fallback.
    pub fn set_link_margin_good_time(&mut self, seconds: u32) {
        self.link_margin_metrics.good_count_threshold = (seconds * SAMPLING_FREQ_HZ) as u16;
    }

    /// Set the time the CCA count must be good to leave fallback.
    pub fn set_cca_good_time(&mut self, seconds: u32) {
        self.cca_metrics.good_count_threshold = (seconds * SAMPLING_FREQ_HZ) as u16;
    }

    /// Set the time the CCA count must be bad to enter fallback.
    pub fn set_cca_bad_time(&mut self, seconds: f32) {
        self.cca_metrics.bad_count_threshold =
            ((seconds * SAMPLING_FREQ_HZ as f32) as u16).max(1);
    }

    /// Reset the activation counter and peak statistics.
    pub fn reset_stats(&mut self, stats: &mut crate::stats::PipelineStats) {
        self.fallback_count = 0;
        self.reset_peak_stats(stats);
    }

    fn update_state(&mut self, ctx: &mut StageCtx<'_>) {
        if self.manual_mode {
            self.init_link_stats();
            self.state = if self.fallback_flag {
                FallbackState::Fallback
            } else {
                FallbackState::Normal
            };
            return;
        }

        self.update_consumer_queue_metrics(ctx);
        self.update_link_stats();

        let queue_avg = self.queue_metrics.queue_length_avg_tenths;
        match self.state {
            FallbackState::Normal => {
                if queue_avg == self.consumer_buffer_size_tenths {
                    // TX queue is full: the link is disconnected.
                    self.link_margin_metrics.threshold =
                        self.link_margin_metrics.threshold_default;
                    self.init_link_stats();
                    self.set_fallback_flag();
                    self.state = FallbackState::FallbackDisconnect;
                } else if queue_avg > self.cfg.consumer_buffer_load_threshold_tenths
                    && !self.fallback_flag
                {
                    // Buffer load threshold reached: measure the current
                    // link margin to use it as the return threshold.
                    self.init_link_stats();
                    self.set_fallback_flag();
                    self.state = FallbackState::WaitThreshold;
                } else if self.cca_metrics.bad_count >= self.cca_metrics.bad_count_threshold {
                    self.link_margin_metrics.threshold =
                        self.link_margin_metrics.threshold_default;
                    self.init_link_stats();
                    self.set_fallback_flag();
                    self.state = FallbackState::WaitThreshold;
                }
            }
            FallbackState::WaitThreshold => {
                if queue_avg == self.consumer_buffer_size_tenths {
                    self.link_margin_metrics.threshold =
                        self.link_margin_metrics.threshold_default;
                    self.state = FallbackState::FallbackDisconnect;
                } else if self.link_margin_metrics.accumulator_average > 0 {
                    // Averaging complete: this becomes the return-to-normal
                    // threshold, clamped around the default.
                    let lm = &mut self.link_margin_metrics;
                    lm.threshold = lm.accumulator_average;
                    if lm.threshold > lm.threshold_default + lm.threshold_hysteresis
                        || lm.threshold
                            < lm.threshold_default.saturating_sub(lm.threshold_hysteresis)
                    {
                        lm.threshold = lm.threshold_default;
                    }
                    self.state = FallbackState::Fallback;
                    self.reset_peak_stats(ctx.stats);
                }
            }
            FallbackState::Fallback => {
                if queue_avg == self.consumer_buffer_size_tenths {
                    self.link_margin_metrics.threshold =
                        self.link_margin_metrics.threshold_default;
                    self.state = FallbackState::FallbackDisconnect;
                } else if self.is_link_good() {
                    self.clear_fallback_flag();
                    self.state = FallbackState::Normal;
                    self.reset_peak_stats(ctx.stats);
                }
            }
            FallbackState::FallbackDisconnect => {
                if self.is_link_good() {
                    self.clear_fallback_flag();
                    self.state = FallbackState::Normal;
                    self.reset_peak_stats(ctx.stats);
                }
            }
        }
    }

    fn init_link_stats(&mut self) {
        let info = self.monitor.fallback_info();

        let lm = &mut self.link_margin_metrics;
        lm.accumulator = 0;
        lm.accumulator_count = 0;
        lm.accumulator_average = 0;
        lm.good_count = 0;

        let cca = &mut self.cca_metrics;
        cca.fail_count_current = info.cca_fail_count;
        cca.cca_event_count_current = info.cca_event_count;
        cca.fail_count_start = cca.fail_count_current;
        cca.cca_event_count_start = cca.cca_event_count_current;

        self.sampling_tick_start = (self.get_tick)();
    }

    fn update_consumer_queue_metrics(&mut self, ctx: &StageCtx<'_>) {
        if !ctx.consumer_buffering_complete {
            return;
        }
        let metrics = &mut self.queue_metrics;
        let idx = usize::from(metrics.queue_length_arr_idx);
        metrics.queue_length_sum -= u16::from(metrics.queue_length_arr[idx]);
        metrics.queue_length_arr[idx] = ctx.consumer_queue_len.min(u16::from(u8::MAX)) as u8;
        metrics.queue_length_sum += u16::from(metrics.queue_length_arr[idx]);
        metrics.queue_length_avg_tenths = (u32::from(metrics.queue_length_sum)
            * BUF_SIZE_DECIMAL_FACTOR)
            / QUEUE_ARRAY_LENGTH as u32;
        metrics.queue_length_arr_idx = ((idx + 1) % QUEUE_ARRAY_LENGTH) as u8;
    }

    fn update_link_stats(&mut self) {
        let now = (self.get_tick)();
        if now.wrapping_sub(self.sampling_tick_start)
            >= self.cfg.tick_frequency_hz / SAMPLING_FREQ_HZ
        {
            // Averaging period reached.
            self.sampling_tick_start = now;
            self.calculate_link_margin_metrics();
            self.calculate_cca_metrics();
        }
    }

    fn calculate_link_margin_metrics(&mut self) {
        let fallback_active = self.fallback_flag;
        let lm = &mut self.link_margin_metrics;
        if lm.accumulator_count == 0 {
            return;
        }

        lm.accumulator_average = (lm.accumulator / u32::from(lm.accumulator_count)) as u8;
        lm.accumulator = 0;
        lm.accumulator_count = 0;
        if u32::from(lm.accumulator_average)
            >= u32::from(lm.threshold) + u32::from(lm.threshold_hysteresis)
            && fallback_active
        {
            lm.good_count = (lm.good_count + 1).min(lm.good_count_threshold);
        } else {
            lm.good_count = 0;
        }
    }

    fn calculate_cca_metrics(&mut self) {
        let info = self.monitor.fallback_info();
        let cca = &mut self.cca_metrics;

        cca.cca_event_count_current = info.cca_event_count;
        cca.cca_event_count = cca
            .cca_event_count_current
            .wrapping_sub(cca.cca_event_count_start);
        cca.cca_event_count_start = cca.cca_event_count_current;

        cca.fail_count_current = info.cca_fail_count;
        cca.fail_count = cca.fail_count_current.wrapping_sub(cca.fail_count_start);
        cca.fail_count_start = cca.fail_count_current;

        if cca.cca_event_count == 0 {
            // No CCA activity this period; averages stay as they were.
            return;
        }
        cca.fail_count_avg = ((u64::from(cca.fail_count) * u64::from(CCA_DECIMAL_FACTOR))
            / u64::from(cca.cca_event_count)) as u32;

        if cca.fail_count_avg > cca.consumer_cca_fail_count_peak {
            cca.consumer_cca_fail_count_peak = cca.fail_count_avg;
        }

        if cca.fail_count_avg <= cca.fail_count_threshold {
            cca.good_count = (cca.good_count + 1).min(cca.good_count_threshold);
            cca.bad_count = 0;
        } else {
            cca.bad_count = (cca.bad_count + 1).min(cca.bad_count_threshold);
            cca.good_count = 0;
        }
    }

    fn is_link_good(&self) -> bool {
        self.link_margin_metrics.good_count >= self.link_margin_metrics.good_count_threshold
            && self.cca_metrics.good_count >= self.cca_metrics.good_count_threshold
    }

    fn reset_peak_stats(&mut self, stats: &mut crate::stats::PipelineStats) {
        self.link_margin_metrics.consumer_link_margin_min_peak = u8::MAX;
        self.cca_metrics.consumer_cca_fail_count_peak = 0;
        stats.consumer_queue_peak_buffer_load = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCfg;
    use crate::stats::PipelineStats;
    use core::cell::Cell;

    std::thread_local! {
        static TICK: Cell<u32> = const { Cell::new(0) };
    }

    fn get_tick() -> u32 {
        TICK.with(|t| t.get())
    }

    fn tick_reset() {
        TICK.with(|t| t.set(0));
    }

    fn tick_advance(ticks: u32) {
        TICK.with(|t| t.set(t.get() + ticks));
    }

    struct QuietLink;

    impl WirelessMonitor for QuietLink {
        fn fallback_info(&mut self) -> WirelessFallbackInfo {
            WirelessFallbackInfo {
                cca_fail_count: 0,
                cca_event_count: 1000,
            }
        }
    }

    fn consumer_cfg(queue_size: u8) -> EndpointCfg {
        EndpointCfg {
            use_encapsulation: true,
            delayed_action: false,
            channel_count: 2,
            audio_payload_size: 120,
            queue_size,
        }
    }

    fn tx_cfg() -> FallbackCfg {
        FallbackCfg {
            is_tx_device: true,
            tick_frequency_hz: 1000,
            consumer_buffer_load_threshold_tenths: 13,
            ..Default::default()
        }
    }

    fn init_tx_stage(queue_size: u8) -> FallbackStage {
        tick_reset();
        let mut stage = FallbackStage::new(tx_cfg(), Box::new(QuietLink), get_tick);
        let mut pool = awl_core::MemPool::new(1024);
        let mut extra = 0u8;
        let mut ctx = StageInitCtx {
            consumer_cfg: consumer_cfg(queue_size),
            mem_pool: &mut pool,
            extra_queue_size: &mut extra,
            consumer_underflow_count: 0,
        };
        stage.init(&mut ctx).unwrap();
        stage
    }

    fn run(
        stage: &mut FallbackStage,
        queue_len: u16,
        stats: &mut PipelineStats,
    ) -> (AudioHeader, bool) {
        let mut fallback = false;
        let mut ctx = StageCtx {
            consumer_cfg: consumer_cfg(11),
            consumer_queue_len: queue_len,
            consumer_queue_limit: 14,
            consumer_buffering_complete: true,
            samples_buffered_size: 0,
            stats,
            fallback_active: &mut fallback,
        };
        let mut header = AudioHeader::default();
        stage
            .process(&mut ctx, &mut header, &[], &mut [])
            .unwrap();
        (header, fallback)
    }

    fn advance_time_good_link(stage: &mut FallbackStage, stats: &mut PipelineStats, periods: u32) {
        for _ in 0..periods {
            // One sampling period = tick_frequency / 10 = 100 ticks.
            tick_advance(100);
            stage.set_rx_link_margin(90);
            run(stage, 1, stats);
        }
    }

    #[test]
    fn test_rx_device_mirrors_header_bit() {
        let mut stage = FallbackStage::new(FallbackCfg::default(), Box::new(QuietLink), get_tick);
        let mut pool = awl_core::MemPool::new(256);
        let mut extra = 0u8;
        let mut ctx = StageInitCtx {
            consumer_cfg: consumer_cfg(4),
            mem_pool: &mut pool,
            extra_queue_size: &mut extra,
            consumer_underflow_count: 0,
        };
        stage.init(&mut ctx).unwrap();
        assert!(stage.is_active());

        let mut stats = PipelineStats::default();
        let mut fallback = false;
        let mut ctx = StageCtx {
            consumer_cfg: consumer_cfg(4),
            consumer_queue_len: 0,
            consumer_queue_limit: 4,
            consumer_buffering_complete: true,
            samples_buffered_size: 0,
            stats: &mut stats,
            fallback_active: &mut fallback,
        };
        let mut header = AudioHeader {
            fallback: false,
            ..Default::default()
        };
        stage.process(&mut ctx, &mut header, &[], &mut []).unwrap();
        assert!(!stage.is_active());
        assert!(!fallback);

        let mut ctx = StageCtx {
            consumer_cfg: consumer_cfg(4),
            consumer_queue_len: 0,
            consumer_queue_limit: 4,
            consumer_buffering_complete: true,
            samples_buffered_size: 0,
            stats: &mut stats,
            fallback_active: &mut fallback,
        };
        let mut header = AudioHeader {
            fallback: true,
            ..Default::default()
        };
        stage.process(&mut ctx, &mut header, &[], &mut []).unwrap();
        assert!(stage.is_active());
        assert!(fallback);
        assert_eq!(stage.fallback_count(), 1);
    }

    #[test]
    fn test_tx_starts_in_fallback_and_recovers() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        assert!(stage.is_active());
        assert_eq!(stage.state(), FallbackState::FallbackDisconnect);

        // CCA good count is pre-loaded; the link margin needs
        // good_time_sec (5 s) of samples above threshold + hysteresis.
        advance_time_good_link(&mut stage, &mut stats, 51);
        assert_eq!(stage.state(), FallbackState::Normal);
        assert!(!stage.is_active());
    }

    #[test]
    fn test_queue_load_triggers_fallback_once() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        advance_time_good_link(&mut stage, &mut stats, 51);
        assert!(!stage.is_active());
        let count_before = stage.fallback_count();

        // Queue lengths averaging 1.4 packets: above the 1.3 threshold.
        let lengths = [1u16, 2, 1, 2, 1, 2, 1, 2, 1, 2, 2, 2, 1, 1, 2, 2, 1, 2, 1, 2, 2, 1, 2, 1, 2, 2, 1, 2, 2, 1];
        for &len in &lengths {
            run(&mut stage, len, &mut stats);
        }

        assert!(stage.is_active());
        assert_eq!(stage.state(), FallbackState::WaitThreshold);
        assert_eq!(stage.fallback_count(), count_before + 1);
    }

    #[test]
    fn test_full_queue_means_disconnect() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        advance_time_good_link(&mut stage, &mut stats, 51);
        assert_eq!(stage.state(), FallbackState::Normal);

        for _ in 0..4 {
            run(&mut stage, 11, &mut stats);
        }
        assert_eq!(stage.state(), FallbackState::FallbackDisconnect);
        assert!(stage.is_active());
    }

    #[test]
    fn test_wait_threshold_adopts_measured_margin() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        advance_time_good_link(&mut stage, &mut stats, 51);

        // Trip the queue threshold.
        for _ in 0..6 {
            run(&mut stage, 2, &mut stats);
        }
        assert_eq!(stage.state(), FallbackState::WaitThreshold);

        // Feed link margin 60 for one sampling period: within default ±
        // hysteresis, adopted as the new threshold.
        tick_advance(100);
        stage.set_rx_link_margin(60);
        run(&mut stage, 1, &mut stats);
        tick_advance(100);
        run(&mut stage, 1, &mut stats);
        assert_eq!(stage.state(), FallbackState::Fallback);
        assert_eq!(stage.link_margin_metrics().threshold, 60);
    }

    #[test]
    fn test_out_of_range_measurement_clamps_to_default() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        advance_time_good_link(&mut stage, &mut stats, 51);
        for _ in 0..6 {
            run(&mut stage, 2, &mut stats);
        }
        assert_eq!(stage.state(), FallbackState::WaitThreshold);

        // 95 is beyond default(50) + hysteresis(20): fall back to default.
        tick_advance(100);
        stage.set_rx_link_margin(95);
        run(&mut stage, 1, &mut stats);
        tick_advance(100);
        run(&mut stage, 1, &mut stats);
        assert_eq!(stage.state(), FallbackState::Fallback);
        assert_eq!(stage.link_margin_metrics().threshold, 50);
    }

    #[test]
    fn test_manual_mode_freezes_state_machine() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        stage.set_manual_mode(true);
        stage.clear_fallback_flag();

        // Queue pressure that would normally trigger fallback.
        for _ in 0..30 {
            run(&mut stage, 8, &mut stats);
        }
        assert!(!stage.is_active());

        stage.set_fallback_flag();
        let (header, _) = run(&mut stage, 1, &mut stats);
        assert!(header.fallback);
    }

    #[test]
    fn test_header_carries_flag() {
        let mut stage = init_tx_stage(11);
        let mut stats = PipelineStats::default();
        let (header, fallback) = run(&mut stage, 1, &mut stats);
        assert!(header.fallback);
        assert!(fallback);
    }
}
