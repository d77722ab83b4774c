//! Deferred work items.
//!
//! A [`Work`] owns one thread that runs its function whenever the item has
//! been scheduled and its deadline has passed. An item is pending at most
//! once: scheduling an already-pending item only pulls its deadline earlier.
//! The function may ask to be run again by returning a delay. Since there is
//! exactly one thread per item, the function never runs concurrently with
//! itself.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{lock, Error};

#[derive(Default)]
struct State {
    due: Option<Instant>,
    running: bool,
    shutdown: bool,
    runs: u64,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        self.wake
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }
}

pub struct Work {
    name: &'static str,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Work {
    /// Creates the work item and starts its thread. Nothing runs until the
    /// item is scheduled.
    pub fn new<F>(name: &'static str, f: F) -> Result<Self, Error>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker_loop(&worker, f))
            .map_err(|_| Error::NoResources)?;

        Ok(Self {
            name,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules the item to run after `delay`. Returns `false` if it was
    /// already pending (its deadline may still move earlier) or has been
    /// cancelled.
    pub fn schedule(&self, delay: Duration) -> bool {
        let mut state = lock(&self.shared.state);
        if state.shutdown {
            return false;
        }
        let queued = schedule_locked(&mut state, Instant::now() + delay);
        self.shared.wake.notify_all();
        queued
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.shared.state).due.is_some()
    }

    /// Number of completed runs.
    pub fn runs(&self) -> u64 {
        lock(&self.shared.state).runs
    }

    /// Blocks until the item is neither pending nor running, or `timeout`
    /// passes. Returns whether the item went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while (state.due.is_some() || state.running) && !state.shutdown {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.shared.wait_timeout(state, deadline - now);
        }
        true
    }

    /// Cancels any pending run and waits for a running one to return. The
    /// item cannot be scheduled again afterwards.
    pub fn cancel_sync(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            state.due = None;
            self.shared.wake.notify_all();
        }

        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // cancelled from inside the work function; the loop exits on return
            return;
        }
        if thread.join().is_err() {
            log::error!("{} worker panicked", self.name);
        }
    }

    /// Whether the item was cancelled and its thread has finished.
    pub fn is_terminated(&self) -> bool {
        let state = lock(&self.shared.state);
        state.shutdown && !state.running && lock(&self.thread).is_none()
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        self.cancel_sync();
    }
}

fn schedule_locked(state: &mut State, due: Instant) -> bool {
    match state.due {
        Some(current) => {
            state.due = Some(current.min(due));
            false
        }
        None => {
            state.due = Some(due);
            true
        }
    }
}

/// Marks the item dead when the work function unwinds, so waiters and
/// [`Work::cancel_sync`] do not hang on a run that never finishes.
struct RunGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let mut state = lock(&self.shared.state);
        state.running = false;
        state.shutdown = true;
        state.due = None;
        self.shared.wake.notify_all();
    }
}

fn worker_loop<F>(shared: &Shared, mut f: F)
where
    F: FnMut() -> Option<Duration>,
{
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            break;
        }
        let Some(due) = state.due else {
            state = shared.wait(state);
            continue;
        };
        let now = Instant::now();
        if now < due {
            state = shared.wait_timeout(state, due - now);
            continue;
        }

        state.due = None;
        state.running = true;
        drop(state);

        let guard = RunGuard { shared };
        let again = f();
        drop(guard);

        state = lock(&shared.state);
        state.running = false;
        state.runs += 1;
        if let Some(delay) = again {
            if !state.shutdown {
                schedule_locked(&mut state, Instant::now() + delay);
            }
        }
        shared.wake.notify_all();
    }
    state.running = false;
    shared.wake.notify_all();
}
