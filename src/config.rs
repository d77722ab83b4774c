use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Error;

/// Chip generation carrying a PTP block.
///
/// The generations differ in where the seconds of a captured timestamp come
/// from, in the order the nanosecond latch words must be read, and in which
/// event messages the block can capture.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChipVariant {
    /// Single port. Latches nanoseconds only; seconds come from the software
    /// counter.
    #[default]
    Jl2xxx,
    /// Three-port variant with hardware second latches and peer-delay
    /// capture.
    Jl3xxx,
}

impl ChipVariant {
    /// Whether captured timestamps carry hardware seconds.
    pub const fn hardware_seconds(self) -> bool {
        matches!(self, ChipVariant::Jl3xxx)
    }

    /// The latch only snapshots correctly when the high nanosecond word is
    /// read first on Jl2xxx; Jl3xxx latches on the low word.
    pub const fn ns_high_word_first(self) -> bool {
        matches!(self, ChipVariant::Jl2xxx)
    }

    /// Whether the chip captures Pdelay_Req/Pdelay_Resp in addition to
    /// Sync/Delay_Req.
    pub const fn peer_delay_capture(self) -> bool {
        matches!(self, ChipVariant::Jl3xxx)
    }
}

/// Tuning of the clock adjustment state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServoConfig {
    /// Largest frequency offset the clock advertises, in ppb.
    pub max_adj_ppb: i64,
    /// Upper bound on step commands issued in one `LoopAdjusting` pass.
    pub loop_iterations: u32,
    /// Step commands issued per `ReadyToStep` pass.
    pub ready_iterations: u32,
    /// Pause after each step command. The device drops commands issued
    /// back to back.
    pub step_delay: Duration,
    /// In the loop phase every n-th step skips the pause.
    pub delay_skip_every: u32,
    /// Largest value the hardware step register holds.
    pub max_step_ns: u16,
    /// Interval between two invocations of the state machine worker.
    pub period: Duration,
}

impl ServoConfig {
    /// Rejects a configuration the state machine cannot scale against.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_adj_ppb <= 0 {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            max_adj_ppb: 100_000,
            loop_iterations: 10_000,
            ready_iterations: 100,
            step_delay: Duration::from_micros(20),
            delay_skip_every: 10,
            max_step_ns: 255,
            period: Duration::from_millis(1),
        }
    }
}

/// Per-PHY configuration of the PTP core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PtpConfig {
    pub variant: ChipVariant,
    /// Let the hardware insert the departure time into Sync messages.
    pub one_step_sync: bool,
    /// Drive the pulse-per-second output pin.
    pub pps_output: bool,
    /// Refuse to read a departure latch whose valid bit is clear.
    pub strict_valid_check: bool,
    /// How long a captured arrival timestamp waits for its packet.
    pub rx_timeout_ticks: u64,
    /// How long a queued packet waits for its timestamp.
    pub tx_timeout_ticks: u64,
    /// Tick rate of the monotonic tick source.
    pub tick_hz: u32,
    /// Index reported through `get_ts_info`.
    pub phc_index: i32,
    pub servo: ServoConfig,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            variant: ChipVariant::default(),
            one_step_sync: false,
            pps_output: true,
            strict_valid_check: true,
            rx_timeout_ticks: 3,
            tx_timeout_ticks: 3,
            tick_hz: 250,
            phc_index: 0,
            servo: ServoConfig::default(),
        }
    }
}

impl PtpConfig {
    /// Length of one tick of the configured tick source.
    pub fn tick(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_hz.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_facts() {
        assert!(!ChipVariant::Jl2xxx.hardware_seconds());
        assert!(ChipVariant::Jl2xxx.ns_high_word_first());
        assert!(ChipVariant::Jl3xxx.peer_delay_capture());
    }

    #[test]
    fn tick_length() {
        let config = PtpConfig::default();
        assert_eq!(config.tick(), Duration::from_millis(4));

        let config = PtpConfig {
            tick_hz: 0,
            ..PtpConfig::default()
        };
        assert_eq!(config.tick(), Duration::from_secs(1));
    }

    #[test]
    fn servo_needs_positive_adjustment_range() {
        assert_eq!(ServoConfig::default().validate(), Ok(()));
        for max_adj_ppb in [0, -1] {
            let config = ServoConfig {
                max_adj_ppb,
                ..ServoConfig::default()
            };
            assert_eq!(config.validate(), Err(Error::Invalid));
        }
    }
}
