//! In-process job queue with per-lane concurrency and retry backoff.
//!
//! Each lane owns one channel and a fixed number of worker tasks.
//! Lifecycle commands run on a concurrency-1 lane so initialize/destroy
//! sequences for a channel are strictly ordered; delivery jobs run on a
//! small concurrent lane since the external send APIs are the
//! bottleneck. Retryable failures are re-enqueued with exponential
//! backoff up to a bounded attempt count.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// How a job handler failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Transient failure; the queue re-attempts with backoff. Used for
    /// "channel unavailable" so delivery recovers once the channel does.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Terminal failure; the job is dropped and logged.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff for the given 1-based attempt number.
fn backoff_for(config: &QueueConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let backoff = config.base_backoff.saturating_mul(2u32.saturating_pow(exp));
    backoff.min(config.max_backoff)
}

struct Envelope<J> {
    job: J,
    attempt: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("queue {0} is shut down")]
pub struct EnqueueError(&'static str);

/// Handle for enqueueing jobs onto one lane.
pub struct JobQueue<J> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<J>>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<J> JobQueue<J>
where
    J: Send + Clone + fmt::Debug + 'static,
{
    /// Start a lane with `concurrency` worker tasks running `handler`.
    ///
    /// Workers finish their in-flight job after cancellation; only
    /// queued jobs are abandoned.
    pub fn start<H, Fut>(
        name: &'static str,
        concurrency: usize,
        config: QueueConfig,
        handler: H,
        cancel: CancellationToken,
    ) -> Self
    where
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send,
    {
        let (tx, rx) = mpsc::channel::<Envelope<J>>(256);
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        for worker in 0..concurrency.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let tx = tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            envelope = rx.recv() => envelope,
                        }
                    };
                    let Some(envelope) = envelope else { break };

                    match handler(envelope.job.clone()).await {
                        Ok(()) => {}
                        Err(JobError::Fatal(reason)) => {
                            tracing::error!(
                                queue = name,
                                worker,
                                attempt = envelope.attempt,
                                job = ?envelope.job,
                                %reason,
                                "Job failed terminally"
                            );
                        }
                        Err(JobError::Retryable(reason)) => {
                            if envelope.attempt >= config.max_attempts {
                                tracing::error!(
                                    queue = name,
                                    attempt = envelope.attempt,
                                    job = ?envelope.job,
                                    %reason,
                                    "Job exhausted its retries"
                                );
                                continue;
                            }
                            let backoff = backoff_for(&config, envelope.attempt);
                            tracing::warn!(
                                queue = name,
                                attempt = envelope.attempt,
                                backoff_ms = backoff.as_millis() as u64,
                                %reason,
                                "Job failed, scheduling retry"
                            );
                            let tx = tx.clone();
                            let next = Envelope {
                                job: envelope.job,
                                attempt: envelope.attempt + 1,
                            };
                            tokio::spawn(async move {
                                tokio::time::sleep(backoff).await;
                                let _ = tx.send(next).await;
                            });
                        }
                    }
                }
                tracing::debug!(queue = name, worker, "Queue worker exited");
            });
        }

        Self { name, tx }
    }

    pub async fn enqueue(&self, job: J) -> Result<(), EnqueueError> {
        self.tx
            .send(Envelope { job, attempt: 1 })
            .await
            .map_err(|_| EnqueueError(self.name))
    }
}
