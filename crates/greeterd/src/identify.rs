//! Identification worker: runs face extraction and matching on its own
//! thread so the scheduler keeps capturing and answering commands while a
//! frame is being processed.

use greeter_core::{ExtractError, FaceExtractor, Identification, Identifier, Matcher, RegistryCache};
use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Frames the worker will hold while busy; further submissions are refused.
const QUEUE_DEPTH: usize = 1;

pub type IdentifyResult = Result<Option<Identification>, ExtractError>;

struct IdentifyJob {
    frame: RgbImage,
    cache: Arc<RegistryCache>,
    reply: oneshot::Sender<IdentifyResult>,
}

/// State of a submitted frame.
#[derive(Debug)]
pub enum JobStatus {
    Running,
    Done(IdentifyResult),
    /// The worker dropped the job without answering.
    Lost,
}

/// Reply handle for one submitted frame. Dropping it abandons the job.
#[derive(Debug)]
pub struct PendingIdentification {
    rx: oneshot::Receiver<IdentifyResult>,
}

impl PendingIdentification {
    /// Non-blocking check for the result.
    pub fn poll(&mut self) -> JobStatus {
        match self.rx.try_recv() {
            Ok(result) => JobStatus::Done(result),
            Err(TryRecvError::Empty) => JobStatus::Running,
            Err(TryRecvError::Closed) => JobStatus::Lost,
        }
    }
}

/// Front end for the thread that owns the [`Identifier`].
pub struct IdentificationWorker {
    tx: Option<mpsc::Sender<IdentifyJob>>,
    worker: Option<JoinHandle<()>>,
    threshold: f32,
    accepted: AtomicU64,
    finished: Arc<AtomicU64>,
}

impl IdentificationWorker {
    /// Move `identifier` onto a dedicated thread. Jobs that take longer than
    /// `budget` are logged.
    pub fn spawn<E, M>(mut identifier: Identifier<E, M>, budget: Duration) -> std::io::Result<Self>
    where
        E: FaceExtractor + Send + 'static,
        M: Matcher + Send + 'static,
    {
        let threshold = identifier.threshold();
        let finished = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel::<IdentifyJob>(QUEUE_DEPTH);

        let done = finished.clone();
        let worker = std::thread::Builder::new()
            .name("greeter-identify".into())
            .spawn(move || {
                tracing::debug!("identification worker started");
                while let Some(job) = rx.blocking_recv() {
                    if job.reply.is_closed() {
                        tracing::trace!("session gone; skipping queued frame");
                    } else {
                        let began = Instant::now();
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            identifier.identify_first(&job.frame, &job.cache)
                        }));
                        let spent = began.elapsed();
                        if spent > budget {
                            tracing::debug!(
                                spent_ms = spent.as_millis() as u64,
                                budget_ms = budget.as_millis() as u64,
                                "identification slower than check interval"
                            );
                        }
                        match outcome {
                            Ok(result) => {
                                let _ = job.reply.send(result);
                            }
                            Err(_) => tracing::warn!("face extractor panicked; frame dropped"),
                        }
                    }
                    done.fetch_add(1, Ordering::Release);
                }
                tracing::debug!("identification worker exiting");
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            threshold,
            accepted: AtomicU64::new(0),
            finished,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Hand a copy of `frame` to the worker. `None` when the worker is still
    /// busy with an earlier frame or has stopped.
    pub fn submit(&self, frame: &RgbImage, cache: Arc<RegistryCache>) -> Option<PendingIdentification> {
        let tx = self.tx.as_ref()?;
        let (reply, rx) = oneshot::channel();
        let job = IdentifyJob {
            frame: frame.clone(),
            cache,
            reply,
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Some(PendingIdentification { rx })
            }
            Err(TrySendError::Full(_)) => {
                tracing::trace!("identification worker busy");
                None
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("identification worker gone");
                None
            }
        }
    }

    /// Block until every accepted frame has been processed.
    #[cfg(test)]
    pub fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.finished.load(Ordering::Acquire) < self.accepted.load(Ordering::Relaxed) {
            assert!(Instant::now() < deadline, "identification worker stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop accepting frames and wait for the worker to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("identification worker panicked during shutdown");
            }
        }
    }
}

impl Drop for IdentificationWorker {
    fn drop(&mut self) {
        self.close();
    }
}
