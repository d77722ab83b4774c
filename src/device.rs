//! Entry points for the PHY driver glue.
//!
//! A [`PtpDevice`] bundles the hardware clock with the receive and transmit
//! timestamping pipelines of one PHY, and owns the three deferred workers
//! driving them.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::PtpConfig;
use crate::hw::PtpHardware;
use crate::packet::{HwTstampConfig, NetStack, Packet, PtpClass, RxFilter, TsInfo, TxType};
use crate::phc::PtpClock;
use crate::regs::PhyRegisters;
use crate::rx::{Arrival, RxPipeline};
use crate::ticks::TickSource;
use crate::tx::{Submitted, TxPipeline};
use crate::work::Work;
use crate::{lock, Error};

pub struct PtpDevice<P> {
    config: PtpConfig,
    hw: Arc<PtpHardware>,
    clock: PtpClock,
    rx: Arc<RxPipeline<P>>,
    tx: Arc<TxPipeline<P>>,
    rx_work: Work,
    tx_work: Work,
    hwtstamp: Mutex<HwTstampConfig>,
    removed: AtomicBool,
}

impl<P: Packet> PtpDevice<P> {
    /// Attaches the PTP core to a PHY. The PTP block itself is brought up by
    /// [`Self::config`] once the link is up.
    pub fn probe(
        phy: Arc<dyn PhyRegisters>,
        stack: Arc<dyn NetStack<P>>,
        config: PtpConfig,
        ticks: Arc<dyn TickSource>,
    ) -> Result<Self, Error> {
        let hw = Arc::new(PtpHardware::new(phy, config.variant));
        let tick = config.tick();

        let rx = Arc::new(RxPipeline::new(
            hw.clone(),
            stack.clone(),
            ticks.clone(),
            config.rx_timeout_ticks,
            tick,
        ));
        let tx = Arc::new(TxPipeline::new(
            hw.clone(),
            stack,
            ticks,
            config.tx_timeout_ticks,
            tick,
            config.strict_valid_check,
        ));
        tx.set_one_step(config.one_step_sync);

        let clock = PtpClock::new(hw.clone(), config.servo.clone(), config.pps_output)?;
        let rx_work = {
            let rx = rx.clone();
            Work::new("ptp-rx", move || rx.run())?
        };
        let tx_work = {
            let tx = tx.clone();
            Work::new("ptp-tx", move || tx.run())?
        };

        let hwtstamp = HwTstampConfig {
            tx_type: if config.one_step_sync {
                TxType::OneStepSync
            } else {
                TxType::Off
            },
            rx_filter: RxFilter::None,
        };

        info!("PTP clock registered ({:?})", config.variant);
        Ok(Self {
            config,
            hw,
            clock,
            rx,
            tx,
            rx_work,
            tx_work,
            hwtstamp: Mutex::new(hwtstamp),
            removed: AtomicBool::new(false),
        })
    }

    /// Detaches from the PHY: stops all workers, waiting for running ones,
    /// then frees every packet still waiting for a timestamp. Calling it
    /// again is a no-op.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clock.shutdown();
        self.rx_work.cancel_sync();
        self.tx_work.cancel_sync();

        let rx = self.rx.purge();
        let tx = self.tx.purge();
        info!("PTP clock removed, {rx} rx and {tx} tx packets purged");
    }

    /// Re-arms the PTP block after the link came up. Only touches the
    /// hardware when the block is still in reset.
    pub fn config(&self, link_up: bool) -> Result<(), Error> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(Error::NoDevice);
        }
        if !link_up {
            return Err(Error::LinkDown);
        }
        if !self.hw.in_reset()? {
            return Ok(());
        }

        let one_step = lock(&self.hwtstamp).tx_type == TxType::OneStepSync;
        self.hw.init(one_step)?;
        self.hw.set_pps(self.config.pps_output)?;
        self.clock.reset_servo();
        Ok(())
    }

    /// Offers a received packet for timestamping. Returns the packet back
    /// when it was not taken; the caller then delivers it itself.
    pub fn rx_timestamp(&self, packet: P, class: PtpClass) -> Option<P> {
        if self.removed.load(Ordering::SeqCst)
            || lock(&self.hwtstamp).rx_filter == RxFilter::None
            || !class.is_supported()
        {
            return Some(packet);
        }

        match self.rx.try_match_on_arrival(packet, class) {
            Arrival::Delivered => None,
            Arrival::Queued => {
                self.rx_work.schedule(Duration::ZERO);
                None
            }
            Arrival::NotPtp(packet) => Some(packet),
        }
    }

    /// Hands over a transmitted packet. It is either queued for its
    /// departure timestamp or freed.
    pub fn tx_timestamp(&self, packet: P, class: PtpClass) {
        if self.removed.load(Ordering::SeqCst)
            || lock(&self.hwtstamp).tx_type == TxType::Off
            || !class.is_supported()
        {
            return;
        }

        if self.tx.submit(packet, class) == Submitted::Queued {
            self.tx_work.schedule(Duration::ZERO);
        }
    }

    /// Queues a received packet for the worker without looking at parked
    /// timestamps first.
    pub fn enqueue_for_rx_timestamp(&self, packet: P, class: PtpClass) {
        if self.removed.load(Ordering::SeqCst) {
            return;
        }
        self.rx.enqueue(packet, class);
        self.rx_work.schedule(Duration::ZERO);
    }

    pub fn enqueue_for_tx_timestamp(&self, packet: P, class: PtpClass) {
        if self.removed.load(Ordering::SeqCst) {
            return;
        }
        self.tx.enqueue(packet, class);
        self.tx_work.schedule(Duration::ZERO);
    }

    /// The PHY raised its timestamp interrupt; drain the arrival latch.
    pub fn interrupt(&self) {
        if self.removed.load(Ordering::SeqCst) {
            return;
        }
        debug!("timestamp interrupt");
        self.rx_work.schedule(Duration::ZERO);
    }

    pub fn get_ts_info(&self) -> TsInfo {
        TsInfo::new(self.config.phc_index)
    }

    /// Applies a `SIOCSHWTSTAMP` request and returns the configuration that
    /// is now in effect.
    pub fn hwtstamp(&self, request: HwTstampConfig) -> Result<HwTstampConfig, Error> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(Error::NoDevice);
        }
        let applied = HwTstampConfig {
            tx_type: request.tx_type,
            rx_filter: request.rx_filter.effective(),
        };
        let one_step = applied.tx_type == TxType::OneStepSync;
        self.hw.set_one_step(one_step)?;
        self.tx.set_one_step(one_step);

        *lock(&self.hwtstamp) = applied;
        debug!("hwtstamp {applied:?}");
        Ok(applied)
    }

    pub fn hwtstamp_config(&self) -> HwTstampConfig {
        *lock(&self.hwtstamp)
    }

    pub fn clock(&self) -> &PtpClock {
        &self.clock
    }

    pub fn rx(&self) -> &RxPipeline<P> {
        &self.rx
    }

    pub fn tx(&self) -> &TxPipeline<P> {
        &self.tx
    }

    /// Blocks until no worker is pending or running, or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let left = || deadline.saturating_duration_since(Instant::now());
        self.rx_work.wait_idle(left())
            && self.tx_work.wait_idle(left())
            && self.clock.wait_idle(left())
    }

    /// Whether all three workers have been stopped for good.
    pub fn is_terminated(&self) -> bool {
        self.rx_work.is_terminated() && self.tx_work.is_terminated() && self.clock.is_terminated()
    }
}

impl<P> Drop for PtpDevice<P> {
    fn drop(&mut self) {
        self.clock.shutdown();
        self.rx_work.cancel_sync();
        self.tx_work.cancel_sync();
    }
}
