//! Reading the arrival and departure capture latches.
use log::debug;

use crate::hw::PtpHardware;
use crate::regs::*;
use crate::{Error, Timestamp};

/// A time captured by the PHY for one PTP event message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HardwareTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
    pub sequence_id: u16,
}

impl HardwareTimestamp {
    pub const fn new(seconds: u64, nanoseconds: u32, sequence_id: u16) -> Self {
        Self {
            seconds,
            nanoseconds,
            sequence_id,
        }
    }

    pub const fn time(&self) -> Timestamp {
        Timestamp::new(self.seconds, self.nanoseconds)
    }
}

impl PtpHardware {
    /// Takes the latest arrival capture, arming the latch for the next one.
    /// Returns `None` when nothing was captured since the last call.
    pub fn read_arrival(&self) -> Result<Option<HardwareTimestamp>, Error> {
        self.read_latch(PTP_RX_TS_PAGE, true)
    }

    /// Takes the latest departure capture.
    ///
    /// With `strict` unset an invalid latch is read anyway and yields
    /// whatever the previous capture left behind; callers must then rely on
    /// the sequence id to reject it.
    pub fn read_departure(&self, strict: bool) -> Result<Option<HardwareTimestamp>, Error> {
        self.read_latch(PTP_TX_TS_PAGE, strict)
    }

    fn read_latch(&self, page: u16, strict: bool) -> Result<Option<HardwareTimestamp>, Error> {
        let seconds = self.time_lock();

        let valid = self.phy.fetch_bit(page, TS_STATUS_REG, TsStatus::VALID.bits())?;
        if !valid {
            if strict {
                debug!("no capture latched on page {page:#06x}");
                return Ok(None);
            }
            debug!("reading stale capture on page {page:#06x}");
        }

        let nanoseconds = self.read_nanos(page, TS_NS_LO_REG, TS_NS_HI_REG)?;
        let seconds = if self.variant().hardware_seconds() {
            self.read_seconds(page, TS_SEC_LO_REG, TS_SEC_MID_REG, TS_SEC_HI_REG)?
        } else {
            *seconds
        };
        let sequence_id = self.phy.read(page, TS_SEQ_ID_REG)?;

        if valid {
            // write one to clear, then drop the bit again
            self.phy.write(page, TS_STATUS_REG, TsStatus::VALID.bits())?;
            self.phy.write(page, TS_STATUS_REG, 0)?;
        }

        Ok(Some(HardwareTimestamp {
            seconds,
            nanoseconds,
            sequence_id,
        }))
    }
}
