use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};

/// Runs a callback on a dedicated thread, coalescing triggers that arrive
/// while a run is still pending into that single run.
#[derive(Debug)]
pub struct AsyncUpdater {
    pending: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl AsyncUpdater {
    /// The thread exits once the updater is dropped.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let pending = Arc::new(AtomicBool::new(false));
        let (wake, woken) = unbounded::<()>();
        let thread_pending = Arc::clone(&pending);
        thread::spawn(move || {
            while woken.recv().is_ok() {
                if thread_pending.swap(false, Ordering::AcqRel) {
                    callback();
                }
            }
        });
        Self { pending, wake }
    }

    pub fn trigger(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            let _ = self.wake.send(());
        }
    }

    /// Drops a trigger that has not started running yet.
    pub fn cancel_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
