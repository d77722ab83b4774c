//! The PHY's PTP hardware clock, as seen by the PTP subsystem.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::config::ServoConfig;
use crate::hw::PtpHardware;
use crate::servo::{scaled_ppm_to_ppb, Servo};
use crate::work::Work;
use crate::{Clock, ClockCapabilities, ClockRequest, Error, Timestamp};

pub struct PtpClock {
    hw: Arc<PtpHardware>,
    servo: Arc<Servo>,
    servo_work: Work,
    pps: bool,
    detached: AtomicBool,
}

impl PtpClock {
    /// Creates the clock and starts its (idle) adjustment worker.
    pub fn new(hw: Arc<PtpHardware>, servo: ServoConfig, pps: bool) -> Result<Self, Error> {
        servo.validate()?;
        let servo = Arc::new(Servo::new(servo));

        let worker_servo = Arc::clone(&servo);
        let worker_hw = Arc::clone(&hw);
        let servo_work = Work::new("ptp-servo", move || worker_servo.run(&*worker_hw))?;

        Ok(Self {
            hw,
            servo,
            servo_work,
            pps,
            detached: AtomicBool::new(false),
        })
    }

    pub fn servo(&self) -> &Servo {
        &self.servo
    }

    /// Drops any outstanding adjustment, e.g. after the PHY came out of
    /// reset.
    pub fn reset_servo(&self) {
        self.servo.reset();
    }

    /// Blocks until the adjustment worker has nothing left to do.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.servo_work.wait_idle(timeout)
    }

    /// Stops the adjustment worker, waiting for a running pass to bail out.
    /// The clock refuses hardware access from then on.
    pub fn shutdown(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.servo.shutdown();
        self.servo_work.cancel_sync();
    }

    pub fn is_terminated(&self) -> bool {
        self.servo_work.is_terminated()
    }

    fn attached(&self) -> Result<(), Error> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::NoDevice);
        }
        Ok(())
    }
}

impl Clock for PtpClock {
    type Error = Error;

    fn now(&self) -> Result<Timestamp, Self::Error> {
        self.attached()?;
        self.hw.read_time()
    }

    fn set_time(&self, time: Timestamp) -> Result<(), Self::Error> {
        self.attached()?;
        self.hw.write_time(time)
    }

    fn capabilities(&self) -> Result<ClockCapabilities, Self::Error> {
        Ok(ClockCapabilities {
            max_frequency_adjustment_ppb: self.servo.config().max_adj_ppb,
            n_per_out: 0,
            pps: self.pps,
        })
    }

    fn adjust_frequency(&self, scaled_ppm: i64) -> Result<(), Self::Error> {
        self.attached()?;
        let ppb = scaled_ppm_to_ppb(scaled_ppm);
        if ppb.unsigned_abs() > self.servo.config().max_adj_ppb.unsigned_abs() {
            return Err(Error::Invalid);
        }
        debug!("frequency adjustment of {ppb} ppb requested");
        self.servo.request(ppb);
        self.servo_work.schedule(Duration::ZERO);
        Ok(())
    }

    fn step_clock(&self, delta_ns: i64) -> Result<Timestamp, Self::Error> {
        self.attached()?;
        let now = self.hw.read_time()?;
        let target = now.checked_add_nanos(delta_ns).ok_or(Error::Invalid)?;
        self.hw.write_time(target)?;
        Ok(target)
    }

    fn enable(&self, _request: ClockRequest, _on: bool) -> Result<(), Self::Error> {
        Err(Error::NotSupported)
    }
}
