//! Register access for the PHY.
//!
//! Callers provide raw MDIO access through [`MdioBus`]; [`PagedPhy`] layers the
//! page-select protocol of the JLSemi parts on top of it and implements
//! [`PhyRegisters`], which is all the PTP core ever talks to.
use std::sync::Mutex;

use bitflags::bitflags;

use crate::{lock, Error};

/// Page select register, identical on every JLSemi generation.
pub const PAGE_SELECT_REG: u8 = 0x1f;

pub const PTP_CFG_PAGE: u16 = 0x0d40;
pub const PTP_CTRL_REG: u8 = 0x10;
pub const PTP_MSG_EN_REG: u8 = 0x11;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtpCtrl: u16 {
        const ENABLE = 1 << 0;
        const ONE_STEP = 1 << 1;
        const PPS = 1 << 2;
        /// Set by hardware after power-up or link loss, cleared by block init.
        const IN_RESET = 1 << 15;
    }
}

bitflags! {
    /// Event messages the block captures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgEnable: u16 {
        const SYNC = 1 << 0;
        const DELAY_REQ = 1 << 1;
        const PDELAY_REQ = 1 << 2;
        const PDELAY_RESP = 1 << 3;
    }
}

pub const PTP_TIME_PAGE: u16 = 0x0d41;
pub const TIME_NS_LO_REG: u8 = 0x10;
pub const TIME_NS_HI_REG: u8 = 0x11;
pub const TIME_SEC_LO_REG: u8 = 0x12;
pub const TIME_SEC_MID_REG: u8 = 0x13;
pub const TIME_SEC_HI_REG: u8 = 0x14;
pub const TIME_CMD_REG: u8 = 0x15;
pub const STEP_NS_REG: u8 = 0x16;
pub const STEP_CTRL_REG: u8 = 0x17;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimeCmd: u16 {
        const LOAD = 1 << 0;
        const SNAPSHOT = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StepCtrl: u16 {
        const GO = 1 << 0;
        const NEGATIVE = 1 << 1;
    }
}

/// Arrival and departure latches share one layout on separate pages.
pub const PTP_RX_TS_PAGE: u16 = 0x0d42;
pub const PTP_TX_TS_PAGE: u16 = 0x0d43;
pub const TS_STATUS_REG: u8 = 0x10;
pub const TS_NS_LO_REG: u8 = 0x11;
pub const TS_NS_HI_REG: u8 = 0x12;
pub const TS_SEC_LO_REG: u8 = 0x13;
pub const TS_SEC_MID_REG: u8 = 0x14;
pub const TS_SEC_HI_REG: u8 = 0x15;
pub const TS_SEQ_ID_REG: u8 = 0x16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TsStatus: u16 {
        /// A capture is latched; write one to release it.
        const VALID = 1 << 0;
    }
}

/// Raw access to the PHY's 32 MDIO registers, without any notion of pages.
pub trait MdioBus: Send + Sync {
    fn read_raw(&self, reg: u8) -> Result<u16, Error>;

    fn write_raw(&self, reg: u8, value: u16) -> Result<(), Error>;
}

/// Paged register primitives the PTP core is written against.
pub trait PhyRegisters: Send + Sync {
    fn read(&self, page: u16, reg: u8) -> Result<u16, Error>;

    fn write(&self, page: u16, reg: u8, value: u16) -> Result<(), Error>;

    /// Clears `mask`, then sets `set`. Returns whether the register changed;
    /// an unchanged register is not written.
    fn modify(&self, page: u16, reg: u8, mask: u16, set: u16) -> Result<bool, Error>;

    /// Switches to `page`, returning the page that was selected before.
    fn select_page(&self, page: u16) -> Result<u16, Error>;

    fn restore_page(&self, previous: u16) -> Result<(), Error>;

    fn set_bits(&self, page: u16, reg: u8, bits: u16) -> Result<bool, Error> {
        self.modify(page, reg, 0, bits)
    }

    fn clear_bits(&self, page: u16, reg: u8, bits: u16) -> Result<bool, Error> {
        self.modify(page, reg, bits, 0)
    }

    /// Whether every bit of `bits` is set.
    fn fetch_bit(&self, page: u16, reg: u8, bits: u16) -> Result<bool, Error> {
        Ok(self.read(page, reg)? & bits == bits)
    }
}

/// Handle implementing [`PhyRegisters`] over an [`MdioBus`].
///
/// Every paged access selects the page, performs the access and restores
/// the previous page while holding the bus lock, so concurrent workers never
/// observe each other's page.
pub struct PagedPhy<M> {
    bus: M,
    lock: Mutex<()>,
}

impl<M: MdioBus> PagedPhy<M> {
    pub fn new(bus: M) -> Self {
        Self {
            bus,
            lock: Mutex::new(()),
        }
    }

    pub fn bus(&self) -> &M {
        &self.bus
    }

    fn select(&self, page: u16) -> Result<u16, Error> {
        let previous = self.bus.read_raw(PAGE_SELECT_REG)?;
        if previous != page {
            self.bus.write_raw(PAGE_SELECT_REG, page)?;
        }
        Ok(previous)
    }

    /// Runs `f` with `page` selected, then restores the previous page even if
    /// `f` failed. The error of `f` wins over a failure to restore.
    fn paged<T>(&self, page: u16, f: impl FnOnce(&M) -> Result<T, Error>) -> Result<T, Error> {
        let _guard = lock(&self.lock);
        let previous = self.select(page)?;
        let result = f(&self.bus);
        let restored = if previous != page {
            self.bus.write_raw(PAGE_SELECT_REG, previous)
        } else {
            Ok(())
        };
        let value = result?;
        restored?;
        Ok(value)
    }
}

impl<M: MdioBus> PhyRegisters for PagedPhy<M> {
    fn read(&self, page: u16, reg: u8) -> Result<u16, Error> {
        self.paged(page, |bus| bus.read_raw(reg))
    }

    fn write(&self, page: u16, reg: u8, value: u16) -> Result<(), Error> {
        self.paged(page, |bus| bus.write_raw(reg, value))
    }

    fn modify(&self, page: u16, reg: u8, mask: u16, set: u16) -> Result<bool, Error> {
        self.paged(page, |bus| {
            let old = bus.read_raw(reg)?;
            let new = (old & !mask) | set;
            if new == old {
                return Ok(false);
            }
            bus.write_raw(reg, new)?;
            Ok(true)
        })
    }

    fn select_page(&self, page: u16) -> Result<u16, Error> {
        let _guard = lock(&self.lock);
        self.select(page)
    }

    fn restore_page(&self, previous: u16) -> Result<(), Error> {
        let _guard = lock(&self.lock);
        self.bus.write_raw(PAGE_SELECT_REG, previous)
    }
}
