//! Access to the PTP block: block initialisation, the global time registers
//! and the clock step command.
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::config::ChipVariant;
use crate::regs::*;
use crate::{lock, Error, Timestamp};

/// The PTP block of one PHY.
pub struct PtpHardware {
    pub(crate) phy: Arc<dyn PhyRegisters>,
    variant: ChipVariant,
    /// Serialises multi-register time sequences across workers. The hardware
    /// only counts nanoseconds, so the guarded value is the software second
    /// counter: it moves only when the time is set.
    seconds: Mutex<u64>,
}

impl PtpHardware {
    pub fn new(phy: Arc<dyn PhyRegisters>, variant: ChipVariant) -> Self {
        Self {
            phy,
            variant,
            seconds: Mutex::new(0),
        }
    }

    pub fn variant(&self) -> ChipVariant {
        self.variant
    }

    pub(crate) fn time_lock(&self) -> MutexGuard<'_, u64> {
        lock(&self.seconds)
    }

    /// Whether the block came out of reset and still needs [`Self::init`].
    pub fn in_reset(&self) -> Result<bool, Error> {
        self.phy.fetch_bit(PTP_CFG_PAGE, PTP_CTRL_REG, PtpCtrl::IN_RESET.bits())
    }

    /// Powers the block up and enables capture of the event messages the
    /// chip supports. The PPS pin is left as it is.
    pub fn init(&self, one_step_sync: bool) -> Result<(), Error> {
        let mut messages = MsgEnable::SYNC | MsgEnable::DELAY_REQ;
        if self.variant.peer_delay_capture() {
            messages |= MsgEnable::PDELAY_REQ | MsgEnable::PDELAY_RESP;
        }
        self.phy.write(PTP_CFG_PAGE, PTP_MSG_EN_REG, messages.bits())?;

        let mut ctrl = PtpCtrl::ENABLE;
        ctrl.set(PtpCtrl::ONE_STEP, one_step_sync);
        self.phy.modify(
            PTP_CFG_PAGE,
            PTP_CTRL_REG,
            (PtpCtrl::IN_RESET | PtpCtrl::ONE_STEP).bits(),
            ctrl.bits(),
        )?;

        info!("PTP block up ({:?}, one-step {})", self.variant, one_step_sync);
        Ok(())
    }

    fn set_ctrl(&self, flag: PtpCtrl, on: bool) -> Result<(), Error> {
        let set = if on { flag } else { PtpCtrl::empty() };
        self.phy
            .modify(PTP_CFG_PAGE, PTP_CTRL_REG, flag.bits(), set.bits())
            .map(drop)
    }

    pub fn set_one_step(&self, on: bool) -> Result<(), Error> {
        self.set_ctrl(PtpCtrl::ONE_STEP, on)
    }

    pub fn set_pps(&self, on: bool) -> Result<(), Error> {
        self.set_ctrl(PtpCtrl::PPS, on)
    }

    /// Reads nanoseconds from a pair of 16 bit registers in the order the
    /// chip latches them. Reading in the wrong order returns a mix of the
    /// current and the previous value.
    pub(crate) fn read_nanos(&self, page: u16, lo: u8, hi: u8) -> Result<u32, Error> {
        let (lo, hi) = if self.variant.ns_high_word_first() {
            let hi = self.phy.read(page, hi)?;
            (self.phy.read(page, lo)?, hi)
        } else {
            let lo = self.phy.read(page, lo)?;
            (lo, self.phy.read(page, hi)?)
        };
        Ok((u32::from(hi & 0x3fff) << 16) | u32::from(lo))
    }

    pub(crate) fn read_seconds(&self, page: u16, lo: u8, mid: u8, hi: u8) -> Result<u64, Error> {
        let lo = u64::from(self.phy.read(page, lo)?);
        let mid = u64::from(self.phy.read(page, mid)?);
        let hi = u64::from(self.phy.read(page, hi)?);
        Ok((hi << 32) | (mid << 16) | lo)
    }

    /// Current time: nanoseconds from the hardware counter, seconds from the
    /// software counter.
    pub fn read_time(&self) -> Result<Timestamp, Error> {
        let seconds = self.time_lock();
        let snapshot = TimeCmd::SNAPSHOT.bits();
        self.phy.write(PTP_TIME_PAGE, TIME_CMD_REG, snapshot)?;
        let nanos = self.read_nanos(PTP_TIME_PAGE, TIME_NS_LO_REG, TIME_NS_HI_REG)?;
        Ok(Timestamp::new(*seconds, nanos))
    }

    pub fn write_time(&self, time: Timestamp) -> Result<(), Error> {
        if u64::from(time.nanos) >= crate::NANOS_PER_SECOND {
            return Err(Error::Invalid);
        }
        let mut seconds = self.time_lock();
        let page = PTP_TIME_PAGE;
        self.phy.write(page, TIME_NS_LO_REG, time.nanos as u16)?;
        self.phy.write(page, TIME_NS_HI_REG, (time.nanos >> 16) as u16)?;
        if self.variant.hardware_seconds() {
            self.phy.write(page, TIME_SEC_LO_REG, time.seconds as u16)?;
            self.phy.write(page, TIME_SEC_MID_REG, (time.seconds >> 16) as u16)?;
            self.phy.write(page, TIME_SEC_HI_REG, (time.seconds >> 32) as u16)?;
        }
        self.phy.write(page, TIME_CMD_REG, TimeCmd::LOAD.bits())?;
        *seconds = time.seconds;
        Ok(())
    }

    /// Issues one step command. `ns` must fit the step register.
    pub fn step(&self, ns: u16, negative: bool) -> Result<(), Error> {
        let _seconds = self.time_lock();
        let mut ctrl = StepCtrl::GO;
        ctrl.set(StepCtrl::NEGATIVE, negative);
        self.phy.write(PTP_TIME_PAGE, STEP_NS_REG, ns)?;
        self.phy.write(PTP_TIME_PAGE, STEP_CTRL_REG, ctrl.bits())
    }
}
