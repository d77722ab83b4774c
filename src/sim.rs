//! An in-memory model of the PHY's register file.
//!
//! [`SimPhy`] answers raw MDIO accesses the way the PTP block does: paged
//! registers behind register 0x1f, capture latches with write-1-to-clear
//! valid bits, a global time counter with snapshot/load commands and a step
//! register. It never advances time on its own, which keeps tests
//! deterministic.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use nix::errno::Errno;

use crate::capture::HardwareTimestamp;
use crate::regs::*;
use crate::{lock, Error};

/// A step command as the hardware received it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StepCommand {
    pub ns: u16,
    pub negative: bool,
}

#[derive(Default)]
struct Latch {
    pending: VecDeque<HardwareTimestamp>,
    // what the latch registers still hold after the valid bit was cleared
    stale: HardwareTimestamp,
}

impl Latch {
    fn current(&self) -> HardwareTimestamp {
        self.pending.front().copied().unwrap_or(self.stale)
    }

    fn read(&self, reg: u8) -> Option<u16> {
        let ts = self.current();
        let value = match reg {
            TS_STATUS_REG => {
                if self.pending.is_empty() {
                    0
                } else {
                    TsStatus::VALID.bits()
                }
            }
            TS_NS_LO_REG => ts.nanoseconds as u16,
            TS_NS_HI_REG => (ts.nanoseconds >> 16) as u16,
            TS_SEC_LO_REG => ts.seconds as u16,
            TS_SEC_MID_REG => (ts.seconds >> 16) as u16,
            TS_SEC_HI_REG => (ts.seconds >> 32) as u16,
            TS_SEQ_ID_REG => ts.sequence_id,
            _ => return None,
        };
        Some(value)
    }

    fn clear_valid(&mut self) {
        if let Some(ts) = self.pending.pop_front() {
            self.stale = ts;
        }
    }
}

struct State {
    page: u16,
    regs: HashMap<(u16, u8), u16>,
    rx: Latch,
    tx: Latch,
    seconds: u64,
    nanoseconds: u32,
    steps: Vec<StepCommand>,
    reads: Vec<(u16, u8)>,
    accesses: usize,
    fail_next: Option<Errno>,
}

/// Simulated PHY implementing [`MdioBus`].
pub struct SimPhy {
    state: Mutex<State>,
}

impl Default for SimPhy {
    fn default() -> Self {
        let mut regs = HashMap::new();
        // the PTP block comes out of power-up in reset
        regs.insert((PTP_CFG_PAGE, PTP_CTRL_REG), PtpCtrl::IN_RESET.bits());

        Self {
            state: Mutex::new(State {
                page: 0,
                regs,
                rx: Latch::default(),
                tx: Latch::default(),
                seconds: 0,
                nanoseconds: 0,
                steps: Vec::new(),
                reads: Vec::new(),
                accesses: 0,
                fail_next: None,
            }),
        }
    }
}

impl SimPhy {
    /// Queues an arrival capture. The latch holds one capture at a time; the
    /// next one shows up once the valid bit is cleared.
    pub fn latch_arrival(&self, ts: HardwareTimestamp) {
        lock(&self.state).rx.pending.push_back(ts);
    }

    pub fn latch_departure(&self, ts: HardwareTimestamp) {
        lock(&self.state).tx.pending.push_back(ts);
    }

    pub fn pending_arrivals(&self) -> usize {
        lock(&self.state).rx.pending.len()
    }

    pub fn pending_departures(&self) -> usize {
        lock(&self.state).tx.pending.len()
    }

    pub fn steps(&self) -> Vec<StepCommand> {
        lock(&self.state).steps.clone()
    }

    /// Paged registers read so far, in order.
    pub fn reads(&self) -> Vec<(u16, u8)> {
        lock(&self.state).reads.clone()
    }

    /// Total number of raw MDIO accesses.
    pub fn accesses(&self) -> usize {
        lock(&self.state).accesses
    }

    pub fn clear_log(&self) {
        let mut state = lock(&self.state);
        state.reads.clear();
        state.steps.clear();
    }

    /// Makes the next raw access fail with `errno`.
    pub fn fail_next(&self, errno: Errno) {
        lock(&self.state).fail_next = Some(errno);
    }

    pub fn reg(&self, page: u16, reg: u8) -> u16 {
        lock(&self.state).regs.get(&(page, reg)).copied().unwrap_or(0)
    }

    /// Current value of the free-running time counter.
    pub fn time(&self) -> (u64, u32) {
        let state = lock(&self.state);
        (state.seconds, state.nanoseconds)
    }

    pub fn advance(&self, ns: u64) {
        let mut state = lock(&self.state);
        let total = u64::from(state.nanoseconds) + ns;
        state.seconds += total / 1_000_000_000;
        state.nanoseconds = (total % 1_000_000_000) as u32;
    }

    /// Puts the PTP block back into reset, as a link loss does.
    pub fn reset_ptp_block(&self) {
        lock(&self.state)
            .regs
            .insert((PTP_CFG_PAGE, PTP_CTRL_REG), PtpCtrl::IN_RESET.bits());
    }
}

impl State {
    fn reg(&self, reg: u8) -> u16 {
        self.regs.get(&(self.page, reg)).copied().unwrap_or(0)
    }

    fn snapshot_time(&mut self) {
        let (sec, ns) = (self.seconds, self.nanoseconds);
        let page = PTP_TIME_PAGE;
        self.regs.insert((page, TIME_NS_LO_REG), ns as u16);
        self.regs.insert((page, TIME_NS_HI_REG), (ns >> 16) as u16);
        self.regs.insert((page, TIME_SEC_LO_REG), sec as u16);
        self.regs.insert((page, TIME_SEC_MID_REG), (sec >> 16) as u16);
        self.regs.insert((page, TIME_SEC_HI_REG), (sec >> 32) as u16);
    }

    fn load_time(&mut self) {
        let word = |reg| u64::from(self.reg(reg));
        let nanoseconds = (word(TIME_NS_LO_REG) | word(TIME_NS_HI_REG) << 16) as u32;
        let seconds =
            word(TIME_SEC_LO_REG) | word(TIME_SEC_MID_REG) << 16 | word(TIME_SEC_HI_REG) << 32;
        self.nanoseconds = nanoseconds;
        self.seconds = seconds;
    }

    fn step(&mut self, ns: u16, negative: bool) {
        self.steps.push(StepCommand { ns, negative });

        let now = i128::from(self.seconds) * 1_000_000_000 + i128::from(self.nanoseconds);
        let delta = if negative { -i128::from(ns) } else { i128::from(ns) };
        let stepped = (now + delta).max(0);
        self.seconds = (stepped / 1_000_000_000) as u64;
        self.nanoseconds = (stepped % 1_000_000_000) as u32;
    }
}

impl MdioBus for SimPhy {
    fn read_raw(&self, reg: u8) -> Result<u16, Error> {
        let mut state = lock(&self.state);
        state.accesses += 1;
        if let Some(errno) = state.fail_next.take() {
            return Err(Error::Bus(errno));
        }
        if reg == PAGE_SELECT_REG {
            return Ok(state.page);
        }

        let page = state.page;
        state.reads.push((page, reg));
        let latched = match page {
            PTP_RX_TS_PAGE => state.rx.read(reg),
            PTP_TX_TS_PAGE => state.tx.read(reg),
            _ => None,
        };
        Ok(latched.unwrap_or_else(|| state.reg(reg)))
    }

    fn write_raw(&self, reg: u8, value: u16) -> Result<(), Error> {
        let mut state = lock(&self.state);
        state.accesses += 1;
        if let Some(errno) = state.fail_next.take() {
            return Err(Error::Bus(errno));
        }
        if reg == PAGE_SELECT_REG {
            state.page = value;
            return Ok(());
        }

        match (state.page, reg) {
            (PTP_RX_TS_PAGE, TS_STATUS_REG) => {
                if TsStatus::from_bits_truncate(value).contains(TsStatus::VALID) {
                    state.rx.clear_valid();
                }
            }
            (PTP_TX_TS_PAGE, TS_STATUS_REG) => {
                if TsStatus::from_bits_truncate(value).contains(TsStatus::VALID) {
                    state.tx.clear_valid();
                }
            }
            (PTP_TIME_PAGE, TIME_CMD_REG) => {
                let cmd = TimeCmd::from_bits_truncate(value);
                if cmd.contains(TimeCmd::SNAPSHOT) {
                    state.snapshot_time();
                }
                if cmd.contains(TimeCmd::LOAD) {
                    state.load_time();
                }
            }
            (PTP_TIME_PAGE, STEP_CTRL_REG) => {
                let ctrl = StepCtrl::from_bits_truncate(value);
                if ctrl.contains(StepCtrl::GO) {
                    let ns = state.reg(STEP_NS_REG);
                    state.step(ns, ctrl.contains(StepCtrl::NEGATIVE));
                }
            }
            (page, reg) => {
                state.regs.insert((page, reg), value);
            }
        }
        Ok(())
    }
}
