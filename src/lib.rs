//! PTP hardware clock and packet timestamping for JLSemi Ethernet PHYs.
//!
//! The PHY carries a free-running nanosecond counter that can be nudged by
//! small hardware step commands, and latches that capture the arrival and
//! departure time of PTP event messages. This crate turns those into a PTP
//! hardware clock ([`phc::PtpClock`]) and into per-packet hardware
//! timestamps ([`device::PtpDevice`]).
//!
//! All hardware access goes through the paged register primitives of
//! [`regs::PhyRegisters`], which callers provide by implementing
//! [`regs::MdioBus`] for their MDIO transport.
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod hw;
pub mod packet;
pub mod phc;
pub mod regs;
pub mod rx;
pub mod servo;
pub mod sim;
pub mod ticks;
pub mod tx;
pub mod work;

pub use config::{ChipVariant, PtpConfig, ServoConfig};
pub use device::PtpDevice;
pub use error::Error;

pub(crate) const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// A moment on the PHY's clock.
///
/// The PHY clock has no notion of an epoch; it counts from whatever was last
/// written with [`Clock::set_time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub seconds: u64,
    /// Nanos must be between 0 and 999999999 inclusive
    pub nanos: u32,
}

impl Timestamp {
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    pub const fn as_nanos(&self) -> i128 {
        self.seconds as i128 * NANOS_PER_SECOND as i128 + self.nanos as i128
    }

    /// Moves the timestamp by `delta` nanoseconds, carrying into the seconds.
    /// Returns `None` when the result would lie before zero.
    pub fn checked_add_nanos(&self, delta: i64) -> Option<Self> {
        let total = self.as_nanos() + i128::from(delta);
        if total < 0 {
            return None;
        }
        Some(Self {
            seconds: u64::try_from(total / NANOS_PER_SECOND as i128).ok()?,
            nanos: (total % NANOS_PER_SECOND as i128) as u32,
        })
    }
}

/// Clock adjustment capabilities
///
/// Describes what the PHY clock offers to the PTP subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockCapabilities {
    /// Maximum frequency adjustment capability in parts per billion.
    pub max_frequency_adjustment_ppb: i64,
    /// Number of programmable periodic output pins.
    pub n_per_out: u32,
    /// Whether the clock emits a pulse per second.
    pub pps: bool,
}

/// Requests the PTP subsystem may forward to [`Clock::enable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ClockRequest {
    ExternalTimestamp { index: u32 },
    PeriodicOutput { index: u32 },
    Pps,
}

/// Trait for reading information from and modifying a PTP hardware clock
pub trait Clock {
    type Error: std::error::Error;

    /// Get the current time.
    fn now(&self) -> Result<Timestamp, Self::Error>;

    /// Set the current time.
    fn set_time(&self, time: Timestamp) -> Result<(), Self::Error>;

    /// Get the clock's adjustment capabilities.
    fn capabilities(&self) -> Result<ClockCapabilities, Self::Error>;

    /// Change the frequency of the clock.
    ///
    /// The unit of the input is parts per million with a 16 bit binary
    /// fractional part, as the kernel's `adjfine` hands it over.
    fn adjust_frequency(&self, scaled_ppm: i64) -> Result<(), Self::Error>;

    /// Change the current time of the clock by an offset in nanoseconds.
    /// Returns the time the clock was set to.
    fn step_clock(&self, delta_ns: i64) -> Result<Timestamp, Self::Error>;

    /// Turn an auxiliary clock feature on or off.
    fn enable(&self, request: ClockRequest, on: bool) -> Result<(), Self::Error>;
}

/// Locks `mutex`, carrying on with the data of a panicked holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
