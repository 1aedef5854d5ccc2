/*
 * Interruptible sleep shared by the connection loop and the status heartbeat
 *
 * Shutdown must reach every waiting loop within a few milliseconds, and an
 * operator request must be able to cut a reconnect delay short.
 *
 * cancel() is permanent: every current and future sleep returns immediately.
 * wake() only ends the sleeps in progress at the time of the call.
 */

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct SleeperState {
    canceled: bool,
    wakeups: u64,
}

#[derive(Default)]
pub struct Sleeper {
    pair: CondPair<SleeperState>,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `duration`. Returns true if the sleeper was canceled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.pair.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let wakeups = state.wakeups;

        loop {
            if state.canceled {
                return true;
            }
            if state.wakeups != wakeups {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self
                .pair
                .cvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// End the sleeps in progress early
    pub fn wake(&self) {
        let mut state = self.pair.lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.wakeups = state.wakeups.wrapping_add(1);
        self.pair.cvar.notify_all();
    }

    /// End every sleep, now and later
    pub fn cancel(&self) {
        let mut state = self.pair.lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.canceled = true;
        self.pair.cvar.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        self.pair.lock.lock().unwrap_or_else(PoisonError::into_inner).canceled
    }
}

#[derive(Default)]
struct CondPair<T> {
    lock: Mutex<T>,
    cvar: Condvar,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sleep_times_out() {
        let sleeper = Sleeper::new();
        let start = Instant::now();
        assert!(!sleeper.sleep(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let sleeper = Arc::new(Sleeper::new());
        let s = Arc::clone(&sleeper);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            (s.sleep(Duration::from_secs(10)), start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        sleeper.cancel();
        let (canceled, elapsed) = handle.join().unwrap();
        assert!(canceled);
        assert!(elapsed < Duration::from_secs(1));

        // Later sleeps return at once
        assert!(sleeper.sleep(Duration::from_secs(10)));
        assert!(sleeper.is_canceled());
    }

    #[test]
    fn test_wake_interrupts_without_canceling() {
        let sleeper = Arc::new(Sleeper::new());
        let s = Arc::clone(&sleeper);
        let handle = thread::spawn(move || s.sleep(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(50));
        sleeper.wake();
        assert!(!handle.join().unwrap());
        assert!(!sleeper.is_canceled());
    }

    #[test]
    fn test_wake_before_sleep_is_not_sticky() {
        let sleeper = Sleeper::new();
        sleeper.wake();
        let start = Instant::now();
        assert!(!sleeper.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
