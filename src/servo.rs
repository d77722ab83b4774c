//! Clock adjustment state machine.
//!
//! The hardware can only nudge its clock by a few hundred nanoseconds per
//! step command, and drops commands that come too quickly after each other.
//! A frequency request of N ppb is worked off as N nanoseconds of steps: a
//! long, tightly paced loop for requests near the maximum, bounded bursts for
//! medium ones and a single step per worker run for the residue.
//!
//! ```text
//!            |req| >= 90%                 |req| < 50%
//! Stopped ----------------> LoopAdjusting ---> ReadyToStep ----------> Stepping
//!    ^  \                                       ^   |  (burst, stay)     |  |
//!    |   \---- nonzero, last run Stepping ------|---|------------------>-/  |
//!    |                                          \--- |req| > 50% -----------|
//!    \------------------------------ req == 0 ------------------------------/
//! ```
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, error};

use crate::config::ServoConfig;
use crate::hw::PtpHardware;
use crate::{lock, Error};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ServoState {
    #[default]
    Stopped,
    LoopAdjusting,
    ReadyToStep,
    Stepping,
}

/// The hardware primitive the servo drives.
pub trait StepClock {
    fn step(&self, ns: u16, negative: bool) -> Result<(), Error>;
}

impl StepClock for PtpHardware {
    fn step(&self, ns: u16, negative: bool) -> Result<(), Error> {
        PtpHardware::step(self, ns, negative)
    }
}

/// Converts the kernel's `scaled_ppm` (ppm with a 16 bit fraction) to ppb.
pub fn scaled_ppm_to_ppb(scaled_ppm: i64) -> i64 {
    // at most 125 << 50 in magnitude
    (((1 + i128::from(scaled_ppm)) * 125) >> 13) as i64
}

#[derive(Debug, Default)]
struct Core {
    state: ServoState,
    last_committed_state: ServoState,
}

pub struct Servo {
    config: ServoConfig,
    /// Correction still to be stepped, in ppb.
    requested: AtomicI64,
    /// The request the worker last started working on.
    last_committed: AtomicI64,
    abort: AtomicBool,
    quit: AtomicBool,
    core: Mutex<Core>,
}

impl Servo {
    pub fn new(config: ServoConfig) -> Self {
        Self {
            config,
            requested: AtomicI64::new(0),
            last_committed: AtomicI64::new(0),
            abort: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            core: Mutex::new(Core::default()),
        }
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    pub fn state(&self) -> ServoState {
        lock(&self.core).state
    }

    pub fn requested(&self) -> i64 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn last_committed(&self) -> i64 {
        self.last_committed.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Replaces the outstanding request. A request that reverses the
    /// direction of the one being worked on makes a running loop phase bail
    /// out, instead of overshooting in the old direction.
    ///
    /// The caller schedules the worker afterwards.
    pub fn request(&self, ppb: i64) {
        let max = self.config.max_adj_ppb.max(1);
        let ppb = ppb.clamp(-max, max);
        let last = self.last_committed();
        if i128::from(ppb) * i128::from(last) / i128::from(max) < 0 {
            debug!("servo direction reversed ({last} -> {ppb} ppb), aborting loop");
            self.abort.store(true, Ordering::SeqCst);
        }
        self.requested.store(ppb, Ordering::SeqCst);
    }

    /// Back to `Stopped` with nothing outstanding, as after a PHY reset.
    pub fn reset(&self) {
        self.requested.store(0, Ordering::SeqCst);
        self.last_committed.store(0, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
        *lock(&self.core) = Core::default();
    }

    /// Makes a running loop exit and keeps the worker from rescheduling.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }

    /// One run of the deferred worker: performs the work of the current
    /// state and moves to the next. Returns when to run again.
    pub fn run(&self, hw: &dyn StepClock) -> Option<Duration> {
        if self.quit.load(Ordering::SeqCst) {
            return None;
        }
        let (state, last_committed_state) = {
            let core = lock(&self.core);
            (core.state, core.last_committed_state)
        };

        let next = match state {
            ServoState::Stopped => self.stopped(last_committed_state),
            ServoState::LoopAdjusting => self.loop_adjusting(hw),
            ServoState::ReadyToStep => self.ready_to_step(hw),
            ServoState::Stepping => self.stepping(hw),
        };

        let mut core = lock(&self.core);
        if state == ServoState::Stepping {
            core.last_committed_state = ServoState::Stepping;
        }
        core.state = next;
        if next != state {
            debug!("servo {state:?} -> {next:?}");
        }

        if next == ServoState::Stopped || self.quit.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.config.period)
        }
    }

    fn magnitude_at_least(&self, ppb: i64, percent: i64) -> bool {
        let max = i128::from(self.config.max_adj_ppb);
        i128::from(ppb.unsigned_abs()) * 100 >= max * i128::from(percent)
    }

    fn stopped(&self, last_committed_state: ServoState) -> ServoState {
        let requested = self.requested();
        if requested == 0 {
            return ServoState::Stopped;
        }
        self.abort.store(false, Ordering::SeqCst);
        self.last_committed.store(requested, Ordering::SeqCst);

        if self.magnitude_at_least(requested, 90) {
            ServoState::LoopAdjusting
        } else if last_committed_state == ServoState::Stepping {
            ServoState::Stepping
        } else {
            ServoState::ReadyToStep
        }
    }

    fn loop_adjusting(&self, hw: &dyn StepClock) -> ServoState {
        let skip_every = self.config.delay_skip_every.max(1);
        for i in 1..=self.config.loop_iterations {
            if self.abort.load(Ordering::SeqCst) {
                debug!("servo loop aborted after {} steps", i - 1);
                break;
            }
            if !self.step_once(hw) {
                break;
            }
            if i % skip_every != 0 {
                self.pause();
            }
        }
        ServoState::ReadyToStep
    }

    fn ready_to_step(&self, hw: &dyn StepClock) -> ServoState {
        self.abort.store(false, Ordering::SeqCst);
        let requested = self.requested();
        self.last_committed.store(requested, Ordering::SeqCst);

        if !self.magnitude_at_least(requested, 50) {
            return ServoState::Stepping;
        }
        for _ in 0..self.config.ready_iterations {
            if self.abort.load(Ordering::SeqCst) || !self.step_once(hw) {
                break;
            }
            self.pause();
        }
        ServoState::ReadyToStep
    }

    fn stepping(&self, hw: &dyn StepClock) -> ServoState {
        self.step_once(hw);

        let requested = self.requested();
        if requested == 0 {
            self.last_committed.store(0, Ordering::SeqCst);
            ServoState::Stopped
        } else if requested.unsigned_abs() * 2 > self.config.max_adj_ppb.unsigned_abs() {
            ServoState::ReadyToStep
        } else {
            ServoState::Stepping
        }
    }

    /// Takes up to one step register's worth off the outstanding request and
    /// issues it. Returns `false` when nothing was left.
    fn step_once(&self, hw: &dyn StepClock) -> bool {
        let max_step = i64::from(self.config.max_step_ns.max(1));
        let mut quantum = 0;
        let taken = self
            .requested
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |requested| {
                if requested == 0 {
                    return None;
                }
                quantum = requested.abs().min(max_step);
                Some(requested - requested.signum() * quantum)
            });
        let Ok(previous) = taken else {
            return false;
        };

        if let Err(e) = hw.step(quantum as u16, previous < 0) {
            error!("clock step of {quantum} ns failed: {e}");
        }
        true
    }

    fn pause(&self) {
        if !self.config.step_delay.is_zero() {
            thread::sleep(self.config.step_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::sync::Arc;

    #[derive(Default)]
    struct Steps(Mutex<Vec<(u16, bool)>>);

    impl Steps {
        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        fn total(&self) -> i64 {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|&(ns, negative)| if negative { -i64::from(ns) } else { i64::from(ns) })
                .sum()
        }
    }

    impl StepClock for Steps {
        fn step(&self, ns: u16, negative: bool) -> Result<(), Error> {
            self.0.lock().unwrap().push((ns, negative));
            Ok(())
        }
    }

    fn config() -> ServoConfig {
        ServoConfig {
            max_adj_ppb: 100_000,
            loop_iterations: 100,
            ready_iterations: 20,
            step_delay: Duration::ZERO,
            delay_skip_every: 10,
            max_step_ns: 255,
            period: Duration::from_millis(1),
        }
    }

    /// Runs the worker until it stops asking to be rescheduled, returning
    /// the states it passed through with repeats folded.
    fn run_to_completion(servo: &Servo, hw: &dyn StepClock) -> Vec<ServoState> {
        let mut states = vec![servo.state()];
        for _ in 0..10_000 {
            let again = servo.run(hw);
            let state = servo.state();
            if states.last() != Some(&state) {
                states.push(state);
            }
            if again.is_none() {
                return states;
            }
        }
        panic!("servo did not stop: {states:?}");
    }

    #[test]
    fn ppm_conversion() {
        assert_eq!(scaled_ppm_to_ppb(0), 0);
        // 1 ppm is 65536 scaled units
        assert_eq!(scaled_ppm_to_ppb(65_536), 1_000);
        assert_eq!(scaled_ppm_to_ppb(-65_536 * 10), -10_000);
        assert_eq!(scaled_ppm_to_ppb(i64::MAX), 125 << 50);
        assert_eq!(scaled_ppm_to_ppb(i64::MIN), -(125 << 50));
    }

    #[test]
    fn large_request_converges() {
        let servo = Servo::new(config());
        let steps = Steps::default();
        servo.request(95_000);

        let states = run_to_completion(&servo, &steps);
        assert_eq!(
            states,
            vec![
                ServoState::Stopped,
                ServoState::LoopAdjusting,
                ServoState::ReadyToStep,
                ServoState::Stepping,
                ServoState::Stopped,
            ]
        );
        assert_eq!(servo.requested(), 0);
        assert_eq!(servo.last_committed(), 0);
        assert_eq!(steps.total(), 95_000);
    }

    #[test]
    fn steps_are_capped() {
        let servo = Servo::new(config());
        let steps = Steps::default();
        servo.request(-1_000);

        run_to_completion(&servo, &steps);
        assert_eq!(steps.total(), -1_000);
        assert!(steps.0.lock().unwrap().iter().all(|&(ns, neg)| ns <= 255 && neg));
        assert_eq!(steps.count(), 4);
    }

    #[test]
    fn zero_request_is_idle() {
        let servo = Servo::new(config());
        let steps = Steps::default();
        servo.request(0);

        assert_eq!(servo.run(&steps), None);
        assert_eq!(servo.state(), ServoState::Stopped);
        assert_eq!(steps.count(), 0);
    }

    #[test]
    fn small_request_after_stepping_skips_ready() {
        let servo = Servo::new(config());
        let steps = Steps::default();
        servo.request(300);
        let states = run_to_completion(&servo, &steps);
        assert_eq!(
            states,
            vec![
                ServoState::Stopped,
                ServoState::ReadyToStep,
                ServoState::Stepping,
                ServoState::Stopped
            ]
        );

        servo.request(300);
        servo.run(&steps);
        assert_eq!(servo.state(), ServoState::Stepping);
    }

    #[test]
    fn requests_are_clamped() {
        let servo = Servo::new(config());
        servo.request(10_000_000);
        assert_eq!(servo.requested(), 100_000);

        let servo = Servo::new(ServoConfig {
            max_adj_ppb: -1,
            ..config()
        });
        servo.request(5);
        assert_eq!(servo.requested(), 1);
    }

    #[test]
    fn reversal_sets_abort() {
        let servo = Servo::new(config());
        let steps = Steps::default();
        servo.request(95_000);
        servo.run(&steps);
        assert_eq!(servo.last_committed(), 95_000);

        servo.request(20_000);
        assert!(!servo.abort_requested());
        servo.request(-20_000);
        assert!(servo.abort_requested());
    }

    /// Reverses the request from inside the hardware step, as a concurrent
    /// caller would between two loop iterations.
    struct ReversingClock {
        servo: Arc<Servo>,
        steps: Steps,
        reverse_at: usize,
    }

    impl StepClock for ReversingClock {
        fn step(&self, ns: u16, negative: bool) -> Result<(), Error> {
            self.steps.step(ns, negative)?;
            if self.steps.count() == self.reverse_at {
                self.servo.request(-50_000);
            }
            Ok(())
        }
    }

    #[test]
    fn abort_preempts_loop() {
        let servo = Arc::new(Servo::new(ServoConfig {
            loop_iterations: 1_000_000,
            ..config()
        }));
        let clock = ReversingClock {
            servo: servo.clone(),
            steps: Steps::default(),
            reverse_at: 5,
        };
        servo.request(99_000);

        servo.run(&clock);
        assert_eq!(servo.state(), ServoState::LoopAdjusting);
        servo.run(&clock);
        assert_eq!(servo.state(), ServoState::ReadyToStep);
        assert_eq!(clock.steps.count(), 5);

        // the next phase adopts the new direction
        servo.run(&clock);
        assert!(!servo.abort_requested());
        assert_eq!(servo.last_committed(), -50_000);
        assert!(clock.steps.0.lock().unwrap()[5..].iter().all(|&(_, neg)| neg));
    }

    #[test]
    fn abort_from_another_thread() {
        let servo = Arc::new(Servo::new(ServoConfig {
            loop_iterations: u32::MAX,
            max_step_ns: 1,
            step_delay: Duration::from_micros(50),
            ..config()
        }));
        servo.request(100_000);
        let steps = Steps::default();
        servo.run(&steps);

        let worker = {
            let servo = servo.clone();
            thread::spawn(move || {
                let steps = Steps::default();
                servo.run(&steps);
                steps.count()
            })
        };
        thread::sleep(Duration::from_millis(20));
        servo.request(-100_000);
        let issued = worker.join().unwrap();

        assert!(issued < 100_000);
        assert_eq!(servo.state(), ServoState::ReadyToStep);
    }

    /// Fails every step command.
    struct DeadBus(Steps);

    impl StepClock for DeadBus {
        fn step(&self, ns: u16, negative: bool) -> Result<(), Error> {
            self.0.step(ns, negative)?;
            Err(Error::Bus(Errno::EIO))
        }
    }

    #[test]
    fn failing_steps_still_reach_stopped() {
        let servo = Servo::new(config());
        let bus = DeadBus(Steps::default());
        servo.request(95_000);

        let states = run_to_completion(&servo, &bus);
        assert_eq!(states.last(), Some(&ServoState::Stopped));
        assert_eq!(servo.requested(), 0);
        assert_eq!(bus.0.total(), 95_000);
    }

    #[test]
    fn shutdown_stops_rescheduling() {
        let servo = Servo::new(config());
        let steps = Steps::default();
        servo.request(50_000);
        servo.shutdown();
        assert_eq!(servo.run(&steps), None);
        assert_eq!(steps.count(), 0);
    }
}
