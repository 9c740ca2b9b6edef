// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Time sources for the agent.
//!
//! Everything that waits or checks an expiry takes a [`Clock`] so that tests can run the
//! polling loop and token lifecycle without waiting in real time.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

pub trait Clock: Send + Sync {
    /// The current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Wait for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// The system's wall clock, with Tokio timers for sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// A clock that only moves when told to, or when something sleeps on it.
///
/// Sleeping advances the clock by the requested duration and returns immediately. Clones share
/// the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
    slept: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            slept: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("lock is poisoned");
        *now += duration;
    }

    /// The total time spent in [`Clock::sleep`] so far.
    pub fn slept(&self) -> Duration {
        *self.slept.lock().expect("lock is poisoned")
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("lock is poisoned")
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        *self.slept.lock().expect("lock is poisoned") += duration;
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleeps_instantly() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = ManualClock::new(start);
        let shared = clock.clone();

        clock.sleep(Duration::from_secs(90)).await;
        shared.advance(Duration::from_secs(10));

        assert_eq!(clock.now(), start + Duration::from_secs(100));
        assert_eq!(shared.slept(), Duration::from_secs(90));
    }
}
