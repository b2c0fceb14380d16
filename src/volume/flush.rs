//! Debounce bookkeeping for the background flush thread.
//!
//! Dirtiness is a monotonic generation, not a flag pair: every mark bumps
//! the generation and stamps the clock, the flush thread waits until a full
//! quiet window has passed since the newest stamp, and clearing only
//! succeeds if the generation it captured is still current. A mark racing a
//! flush keeps the state dirty instead of getting lost.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct DebounceState {
    dirty: bool,
    generation: u64,
    stamp: Instant,
    stop: bool,
}

pub(crate) struct FlushScheduler {
    state: Mutex<DebounceState>,
    wake: Condvar,
    window: Duration,
}

impl FlushScheduler {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(DebounceState {
                dirty: false,
                generation: 0,
                stamp: Instant::now(),
                stop: false,
            }),
            wake: Condvar::new(),
            window,
        }
    }

    /// Metadata changed; (re)start the quiet window.
    pub(crate) fn mark_dirty(&self) {
        let mut st = self.state.lock();
        st.dirty = true;
        st.generation += 1;
        st.stamp = Instant::now();
        self.wake.notify_all();
    }

    /// Block until the window elapses on a dirty volume, or until `stop`.
    /// Returns the generation the elapsed window belongs to.
    pub(crate) fn wait_due(&self) -> Option<u64> {
        let mut st = self.state.lock();
        loop {
            if st.stop {
                return None;
            }
            if st.dirty {
                let deadline = st.stamp + self.window;
                let now = Instant::now();
                if now >= deadline {
                    return Some(st.generation);
                }
                self.wake.wait_for(&mut st, deadline - now);
            } else {
                self.wake.wait(&mut st);
            }
        }
    }

    /// Clear dirtiness if nothing newer was marked; a lost race keeps it.
    pub(crate) fn confirm(&self, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.generation == generation {
            st.dirty = false;
            true
        } else {
            false
        }
    }

    /// Failed or deferred flush: wait a full window before the next try.
    pub(crate) fn rearm(&self) {
        self.state.lock().stamp = Instant::now();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stop = true;
        self.wake.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn window_measures_from_the_newest_mark() {
        let sched = Arc::new(FlushScheduler::new(Duration::from_millis(80)));
        let started = Instant::now();
        sched.mark_dirty();

        let remark = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                sched.mark_dirty();
                Instant::now()
            })
        };

        let generation = sched.wait_due().unwrap();
        let woke = Instant::now();
        let remarked = remark.join().unwrap();
        assert_eq!(generation, 2);
        // Two marks: the window restarted at the second one, and the wait
        // fired promptly once it elapsed instead of eating another window.
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert!(woke.duration_since(remarked) < Duration::from_millis(400));
    }

    #[test]
    fn stop_wakes_an_idle_waiter() {
        let sched = Arc::new(FlushScheduler::new(Duration::from_secs(60)));
        let stopper = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sched.stop();
            })
        };
        let started = Instant::now();
        assert_eq!(sched.wait_due(), None);
        assert!(started.elapsed() < Duration::from_secs(10));
        stopper.join().unwrap();
    }

    #[test]
    fn confirm_loses_to_a_newer_mark() {
        let sched = FlushScheduler::new(Duration::from_millis(1));
        sched.mark_dirty();
        thread::sleep(Duration::from_millis(5));
        let generation = sched.wait_due().unwrap();

        sched.mark_dirty();
        assert!(!sched.confirm(generation));
        assert!(sched.is_dirty());

        thread::sleep(Duration::from_millis(5));
        let newer = sched.wait_due().unwrap();
        assert!(sched.confirm(newer));
        assert!(!sched.is_dirty());
    }

    #[test]
    fn clean_scheduler_blocks_until_marked() {
        let sched = Arc::new(FlushScheduler::new(Duration::from_millis(10)));
        let marker = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                sched.mark_dirty();
            })
        };
        let started = Instant::now();
        assert!(sched.wait_due().is_some());
        assert!(started.elapsed() >= Duration::from_millis(40));
        marker.join().unwrap();
    }
}
