//! Timer-driven background threads.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

/// A named thread running a closure on a fixed interval until stopped.
///
/// The loop wakes early when stopped, so teardown does not wait for the
/// interval to elapse.
pub struct Ticker {
    name: String,
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
    exited: Arc<(Mutex<bool>, Condvar)>,
}

impl Ticker {
    pub fn spawn(
        name: impl Into<String>,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Self {
        let name = name.into();
        let (shutdown, rx) = mpsc::channel::<()>();
        let exited = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_exited = Arc::clone(&exited);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => tick(),
                        _ => break,
                    }
                }
                let (lock, condvar) = &*thread_exited;
                *lock.lock().unwrap() = true;
                condvar.notify_all();
            })
            .expect("failed to spawn background thread");
        Ticker {
            name,
            shutdown: Some(shutdown),
            handle: Some(handle),
            exited,
        }
    }

    /// Stop the loop. With a timeout, a tick stuck in a blocking call is
    /// abandoned (the thread is detached) instead of hanging teardown.
    pub fn stop(&mut self, timeout: Option<Duration>) {
        drop(self.shutdown.take());
        let Some(handle) = self.handle.take() else {
            return;
        };
        match timeout {
            None => {
                let _ = handle.join();
            }
            Some(timeout) => {
                let (lock, condvar) = &*self.exited;
                let guard = lock.lock().unwrap();
                let (guard, result) = condvar
                    .wait_timeout_while(guard, timeout, |done| !*done)
                    .unwrap();
                drop(guard);
                if result.timed_out() {
                    warn!(name = %self.name, "abandoning stuck worker");
                } else {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop(None);
    }
}

/// Run `f` on a throwaway thread, waiting at most `timeout` for it to
/// finish. Returns false if it was abandoned.
pub fn run_detached_with_timeout(
    name: &str,
    timeout: Duration,
    f: impl FnOnce() + Send + 'static,
) -> bool {
    let exited = Arc::new((Mutex::new(false), Condvar::new()));
    let thread_exited = Arc::clone(&exited);
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            f();
            let (lock, condvar) = &*thread_exited;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        });
    if spawned.is_err() {
        return false;
    }
    let (lock, condvar) = &*exited;
    let guard = lock.lock().unwrap();
    let (_guard, result) = condvar
        .wait_timeout_while(guard, timeout, |done| !*done)
        .unwrap();
    if result.timed_out() {
        warn!(name, "operation exceeded its timeout, detaching");
        false
    } else {
        true
    }
}
