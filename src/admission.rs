//! Local admission control: sliding-window rate plus concurrency cap
//!
//! Everything here is synchronous and process-local. The coordinator swaps
//! in a new [`Quota`] whenever the group rebalances; callers only ever see
//! `start() -> bool` and `end()`.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::quota::Quota;

/// Upper bound on start log slots reserved ahead of use. Larger rates grow
/// the log on demand.
const START_LOG_RESERVE: usize = 1024;

fn reserve_for(quota: &Quota) -> usize {
    (quota.rate() as usize).min(START_LOG_RESERVE)
}

/// In-flight count plus the start times still inside the trailing window
#[derive(Debug, Default)]
struct AdmissionState {
    active_count: u32,
    /// Oldest first
    start_log: VecDeque<Instant>,
}

impl AdmissionState {
    /// Drop every start at least one full window old
    fn prune(&mut self, now: Instant, quota: &Quota) {
        let window = quota.interval_duration();
        while let Some(oldest) = self.start_log.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.start_log.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Decides locally whether a unit of work may begin.
#[derive(Debug)]
pub struct AdmissionController {
    quota: RwLock<Quota>,
    state: Mutex<AdmissionState>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(quota: Quota) -> Self {
        Self::with_clock(quota, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(quota: Quota, clock: Arc<dyn Clock>) -> Self {
        let state = AdmissionState {
            active_count: 0,
            start_log: VecDeque::with_capacity(reserve_for(&quota)),
        };
        Self {
            quota: RwLock::new(quota),
            state: Mutex::new(state),
            clock,
        }
    }

    /// Admit one operation if both the concurrency cap and the rate window
    /// allow it. A rejected call changes nothing.
    pub fn start(&self) -> bool {
        let quota = self.quota();
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.prune(now, &quota);

        if let Some(limit) = quota.concurrency() {
            if state.active_count >= limit {
                return false;
            }
        }
        if state.start_log.len() >= quota.rate() as usize {
            return false;
        }

        state.start_log.push_back(now);
        state.active_count += 1;
        true
    }

    /// Release one concurrency slot. The rate slot stays spent until it ages
    /// out of the window. Extra calls are ignored.
    pub fn end(&self) {
        let mut state = self.lock_state();
        state.active_count = state.active_count.saturating_sub(1);
    }

    /// Currently assigned share
    pub fn quota(&self) -> Quota {
        *self.quota.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_count(&self) -> u32 {
        self.lock_state().active_count
    }

    /// Starts still counted against the rate in the trailing window
    pub fn window_usage(&self) -> usize {
        let quota = self.quota();
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.prune(now, &quota);
        state.start_log.len()
    }

    /// Swap in a whole new share. Returns the share it replaced.
    pub fn set_quota(&self, quota: Quota) -> Quota {
        let previous = {
            let mut current = self.quota.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, quota)
        };
        if quota.rate() > previous.rate() {
            let mut state = self.lock_state();
            let additional = reserve_for(&quota).saturating_sub(state.start_log.len());
            state.start_log.reserve(additional);
        }
        previous
    }

    fn lock_state(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
