//! Notification dispatcher: hands resolved names to a notifier on its own
//! worker thread so speech never stalls the verification loop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Pending notifications the worker will hold before new ones are dropped.
pub const QUEUE_DEPTH: usize = 1;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with {status}")]
    CommandFailed { command: String, status: String },
}

/// Out-of-band announcement of a resolved name.
///
/// Runs on the dispatcher worker and may block.
pub trait Notifier: Send {
    fn announce(&mut self, name: &str) -> Result<(), NotifyError>;
}

/// Fire-and-forget front end for a single notifier worker.
pub struct NotificationDispatcher {
    tx: Option<mpsc::Sender<String>>,
    worker: Option<JoinHandle<()>>,
    submitted: AtomicU64,
}

impl NotificationDispatcher {
    /// Start the worker thread that owns `notifier`.
    pub fn spawn(mut notifier: Box<dyn Notifier>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_DEPTH);

        let worker = std::thread::Builder::new()
            .name("greeter-notify".into())
            .spawn(move || {
                tracing::debug!("notification worker started");
                while let Some(name) = rx.blocking_recv() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| notifier.announce(&name)));
                    match outcome {
                        Ok(Ok(())) => tracing::debug!(name = %name, "notification delivered"),
                        Ok(Err(e)) => tracing::warn!(name = %name, error = %e, "notifier failed"),
                        Err(_) => tracing::warn!(name = %name, "notifier panicked"),
                    }
                }
                tracing::debug!("notification worker exiting");
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            submitted: AtomicU64::new(0),
        })
    }

    /// Queue `name` for announcement without blocking.
    ///
    /// Returns `false` if the queue was full or the worker is gone; the
    /// notification is dropped in that case.
    pub fn submit(&self, name: &str) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(name.to_string()) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(name)) => {
                tracing::warn!(name = %name, "notification queue full; dropping");
                false
            }
            Err(TrySendError::Closed(name)) => {
                tracing::warn!(name = %name, "notification worker gone; dropping");
                false
            }
        }
    }

    /// Notifications accepted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Stop accepting work and wait for queued notifications to finish.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("notification worker panicked during shutdown");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}
