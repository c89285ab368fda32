//! Serialized session rebuilds.
//!
//! A single worker task runs rebuild jobs one at a time. Loss notifications
//! that arrive while a job is queued or running are coalesced into it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DiscoveryResult;
use crate::metrics;

/// Rebuilds the session and everything bound to it.
#[async_trait]
pub trait Reconnect: Send + Sync + 'static {
    async fn reconnect(&self) -> DiscoveryResult<()>;
}

#[derive(Debug)]
pub struct ReconnectSupervisor {
    in_progress: Arc<AtomicBool>,
    jobs: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectSupervisor {
    /// Start the worker.
    pub fn spawn(target: Arc<dyn Reconnect>) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let in_progress = Arc::new(AtomicBool::new(false));
        let guard = Arc::clone(&in_progress);

        let worker = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let target = Arc::clone(&target);
                // own task so a panicking job cannot take the worker down
                let job = tokio::spawn(async move { target.reconnect().await });
                match job.await {
                    Ok(Ok(())) => {
                        metrics::DISCOVERY_RECONNECTS.inc();
                        info!("coordination session rebuilt");
                    }
                    Ok(Err(e)) => {
                        metrics::DISCOVERY_RECONNECT_ERRORS.inc();
                        error!(error = %e, "coordination session rebuild failed");
                    }
                    Err(e) => {
                        metrics::DISCOVERY_RECONNECT_ERRORS.inc();
                        error!(error = %e, "coordination session rebuild aborted");
                    }
                }
                guard.store(false, Ordering::Release);
            }
            debug!("reconnect worker stopped");
        });

        Self {
            in_progress,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Request a rebuild. Returns false if it was coalesced into one already
    /// in flight, or the supervisor is shut down.
    pub fn notify_lost(&self) -> bool {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::DISCOVERY_RECONNECTS_COALESCED.inc();
            debug!("reconnect already in progress, coalescing loss notification");
            return false;
        }
        let queued = match self.jobs.lock().as_ref() {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        };
        if !queued {
            self.in_progress.store(false, Ordering::Release);
            debug!("reconnect worker is shut down, dropping loss notification");
        }
        queued
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Close the job channel and wait for the worker. A running job finishes.
    pub async fn shutdown(&self) {
        self.jobs.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "reconnect worker ended abnormally");
            }
        }
    }
}
