//! One-shot wake signal with a bounded wait.
//!
//! Maps the event-group "wait for bit 0" pattern onto a plain condition
//! variable: the distributor waits for ACKs, the reboot coordinator waits
//! for readiness, both with a timeout per wait. Only one bit was ever used
//! upstream, so there is no multi-bit shape to carry forward here.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct WakeSignal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            raised: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Wake any waiter. Safe to call with no waiter present; the next
    /// `wait_timeout` call returns immediately in that case.
    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap();
        *raised = true;
        self.condvar.notify_all();
    }

    /// Block until `raise()` is called or `timeout` elapses. Returns
    /// `true` if woken by a raise, `false` on timeout. Clears the raised
    /// flag on return either way, so the signal behaves as one-shot per
    /// wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut raised = self.raised.lock().unwrap();
        if !*raised {
            let (guard, result) = self
                .condvar
                .wait_timeout_while(raised, timeout, |r| !*r)
                .unwrap();
            raised = guard;
            if result.timed_out() && !*raised {
                return false;
            }
        }
        *raised = false;
        true
    }

    /// Clear any pending raise without waiting.
    pub fn clear(&self) {
        *self.raised.lock().unwrap() = false;
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_times_out_when_never_raised() {
        let sig = WakeSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn raise_before_wait_is_observed() {
        let sig = WakeSignal::new();
        sig.raise();
        assert!(sig.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn raise_from_another_thread_wakes_waiter() {
        let sig = Arc::new(WakeSignal::new());
        let sig2 = sig.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sig2.raise();
        });
        assert!(sig.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn clear_drops_a_pending_raise() {
        let sig = WakeSignal::new();
        sig.raise();
        sig.clear();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
    }
}
