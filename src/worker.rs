//! Periodic worker.
//!
//! A single background thread woken on a fixed cadence, cancelled by
//! dropping the stop channel's sender rather than polling a flag: this
//! unblocks the thread's `recv_timeout` immediately instead of waiting out
//! the remainder of the current tick.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Holds the background thread handle and the stop channel sender.
/// Dropping it signals the thread to exit and joins it.
struct StopHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StopHandle {
    fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drives `tick` at `interval` until dropped.
pub struct PeriodicWorker {
    handle: Option<StopHandle>,
}

impl PeriodicWorker {
    /// Spawn the worker. `tick` runs once immediately before the first
    /// wait, then once per interval, until the worker is dropped.
    pub fn spawn(interval: Duration, tick: impl Fn() + Send + Sync + 'static) -> Self {
        let tick = Arc::new(tick);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_tick = Arc::clone(&tick);
        let thread = std::thread::Builder::new()
            .name("fragshim-periodic".into())
            .spawn(move || loop {
                thread_tick();
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
            })
            .expect("failed to spawn periodic worker thread");

        Self {
            handle: Some(StopHandle {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
        }
    }

    /// Stop the worker and wait for its thread to exit. Safe to call more
    /// than once; also runs implicitly on drop.
    pub fn stop(&mut self) {
        self.handle.take();
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
