//! Mute-on-underflow stage.
//!
//! Last stage of a receiving pipeline. When the consumer underflow counter
//! advances, the next `reload_value` packets are zero-filled so the
//! re-buffering glitch is silent instead of a stutter. Derive the reload
//! from [`packets_in_ms`](crate::format::packets_in_ms) with ~30 ms.

use crate::error::{Error, Result};
use crate::header::AudioHeader;
use crate::stages::{StageCtx, StageInitCtx};

/// Mute stage control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuteCmd {
    /// Set the number of packets muted after an underflow.
    SetReload = 0,
}

/// Zero-fill stage armed by consumer underflows.
pub struct MuteStage {
    /// Packets muted after the last underflow.
    pub reload_value: u32,
    counter: u32,
    underflow_count: u32,
}

impl MuteStage {
    /// Create a mute stage with the given reload value.
    pub fn new(reload_value: u32) -> Self {
        Self {
            reload_value,
            counter: 0,
            underflow_count: 0,
        }
    }

    pub(crate) fn init(&mut self, ctx: &mut StageInitCtx<'_>) -> Result<()> {
        self.counter = 0;
        self.underflow_count = ctx.consumer_underflow_count;
        Ok(())
    }

    pub(crate) fn ctrl(&mut self, cmd: u8, arg: u32) -> Result<u32> {
        match cmd {
            c if c == MuteCmd::SetReload as u8 => {
                self.reload_value = arg;
                Ok(0)
            }
            _ => Err(Error::InvalidCmd),
        }
    }

    pub(crate) fn process(
        &mut self,
        ctx: &mut StageCtx<'_>,
        _header: &mut AudioHeader,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u16> {
        let current_underflow_count = ctx.stats.consumer_buffer_underflow_count;

        if current_underflow_count != self.underflow_count && current_underflow_count != 0 {
            // Underflow count changed but was not reset.
            self.counter = self.reload_value;
        }
        self.underflow_count = current_underflow_count;

        if self.counter > 0 {
            output[..input.len()].fill(0);
            self.counter -= 1;
            return Ok(input.len() as u16);
        }

        Ok(0)
    }
}
