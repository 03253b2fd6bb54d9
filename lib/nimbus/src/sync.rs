use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Manual-reset event. The invalidation worker parks on one of these and is
/// woken by the frame notification paths and by shutdown.
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    #[inline]
    pub fn new() -> Event {
        Event {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Raises the event and wakes every waiter. The event stays raised until
    /// a waiter consumes it.
    pub fn set(&self) {
        let mut flag = self.flag.lock().expect("Event mutex poisoned");
        *flag = true;
        self.cond.notify_all();
    }

    /// Blocks until the event is raised, then lowers it.
    pub fn wait_and_clear(&self) {
        let mut flag = self.flag.lock().expect("Event mutex poisoned");
        while !*flag {
            flag = self.cond.wait(flag).expect("Event mutex poisoned");
        }
        *flag = false;
    }
}

/// Cooperative interruption flag shared by the worker threads. Sleeping
/// through it lets `trigger` wake a worker mid-wait at shutdown.
pub struct Interrupt {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Interrupt {
    #[inline]
    pub fn new() -> Interrupt {
        Interrupt {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Raises the flag and wakes every sleeper. There is no way back; the
    /// flag stays raised for the rest of the session.
    pub fn trigger(&self) {
        let mut flag = self.flag.lock().expect("Interrupt mutex poisoned");
        *flag = true;
        self.cond.notify_all();
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.flag.lock().expect("Interrupt mutex poisoned")
    }

    /// Sleeps for `timeout` unless interrupted earlier. Returns true when the
    /// sleep ended because of an interruption.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock().expect("Interrupt mutex poisoned");

        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self
                .cond
                .wait_timeout(flag, deadline - now)
                .expect("Interrupt mutex poisoned");
            flag = guard;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new());

        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_and_clear())
        };

        event.set();
        waiter.join().unwrap();
    }

    #[test]
    fn test_event_set_before_wait_is_not_lost() {
        let event = Event::new();

        event.set();
        event.wait_and_clear();
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let interrupt = Interrupt::new();

        assert!(!interrupt.sleep(Duration::from_millis(5)));
        assert!(!interrupt.is_set());
    }

    #[test]
    fn test_trigger_cuts_sleep_short() {
        let interrupt = Arc::new(Interrupt::new());

        let sleeper = {
            let interrupt = interrupt.clone();
            thread::spawn(move || interrupt.sleep(Duration::from_secs(30)))
        };

        interrupt.trigger();

        assert!(sleeper.join().unwrap());
        assert!(interrupt.is_set());
    }
}
