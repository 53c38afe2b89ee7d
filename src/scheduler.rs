use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Periodic background runner for the GC and snapshot threads.
///
/// The closure runs once per interval until [`Scheduler::stop`] (or drop).
/// Stopping wakes the thread immediately rather than waiting out the
/// current interval.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl Scheduler {
    pub(crate) fn run<F>(name: &'static str, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                {
                    let mut stopped = thread_shared.stopped.lock();
                    if !*stopped {
                        thread_shared.wakeup.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        debug!(thread = name, "scheduler.stopped");
                        return;
                    }
                }
                job();
            })
            .expect("failed to spawn scheduler thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_periodically_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let mut scheduler = Scheduler::run("test", Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        while counter.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(2));
        }
        scheduler.stop();
        let after_stop = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }
}
