//! # Registration Manager
//!
//! Decouples "a local publisher/subscriber/service was created" from "it is
//! durably registered with the master". Creating a session never blocks on
//! the master and never loses its registration: the call is queued here and
//! retried until it succeeds or the node shuts down.
//!
//! ## Model
//!
//! A handle + actor pair. Jobs are drained FIFO by a single worker from an
//! unbounded queue — submission never blocks and never drops a job while the
//! manager is alive. Each job is one directory call (the closure also
//! applies the local success-side effects, e.g. marking the session
//! registered). A failed job is rescheduled after a fixed delay by an
//! independent timer task, so one failing job's wait never blocks the jobs
//! behind it.
//!
//! ## Health
//!
//! - [`RegistrationManager::is_registration_ok`]: true iff no job is
//!   currently in a failed/retrying state.
//! - [`RegistrationManager::pending_count`]: jobs not yet confirmed
//!   successful.
//!
//! Shutdown raises a cancellation signal the worker selects on, so queued
//! and retrying jobs are dropped immediately and an in-flight call is
//! interrupted mid-wait rather than run to completion. Final unregistration
//! is the node's responsibility, not this worker's.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Delay before a failed registration call is attempted again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the lifecycle event stream. A lagging listener misses events
/// rather than slowing the worker.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Lifecycle notification for one job attempt, delivered over a broadcast
/// channel so listeners never block the worker.
#[derive(Clone, Debug)]
pub enum RegistrationEvent {
    Succeeded { description: String },
    /// The attempt failed; the job is parked on its retry timer.
    Failed { description: String },
}

type JobCall =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

struct Job {
    /// Short description for logs, e.g. `registerPublisher /chatter`.
    description: String,
    call: JobCall,
    /// Set once the job has failed at least once and is being retried.
    retrying: bool,
}

/// Counters shared between the handle and the actor so health queries never
/// touch the queue.
#[derive(Default)]
struct Health {
    pending: AtomicUsize,
    failed: AtomicUsize,
}

struct RegistrationActor {
    health: Arc<Health>,
    retry_delay: Duration,
    job_tx: mpsc::UnboundedSender<Job>,
    events: broadcast::Sender<RegistrationEvent>,
}

impl RegistrationActor {
    async fn run(
        self,
        mut job_rx: mpsc::UnboundedReceiver<Job>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        loop {
            // `changed` also resolves when every handle is dropped, which
            // ends the worker the same way an explicit shutdown does.
            let job = tokio::select! {
                _ = cancel_rx.changed() => break,
                job = job_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel_rx.changed() => break,
                _ = self.execute(job) => {}
            }
        }
        debug!("registration manager shutting down");
    }

    async fn execute(&self, mut job: Job) {
        match (job.call)().await {
            Ok(()) => {
                self.health.pending.fetch_sub(1, Ordering::SeqCst);
                if job.retrying {
                    self.health.failed.fetch_sub(1, Ordering::SeqCst);
                }
                info!(job = %job.description, "master registration complete");
                // No receivers just means nobody is listening.
                let _ = self
                    .events
                    .send(RegistrationEvent::Succeeded { description: job.description });
            }
            Err(error) => {
                if !job.retrying {
                    self.health.failed.fetch_add(1, Ordering::SeqCst);
                    job.retrying = true;
                }
                warn!(
                    job = %job.description,
                    error = %error,
                    delay_secs = self.retry_delay.as_secs_f32(),
                    "master registration failed and will be retried"
                );
                let _ = self.events.send(RegistrationEvent::Failed {
                    description: job.description.clone(),
                });
                // Independent timer: the queue keeps draining while this
                // job waits out its delay.
                let job_tx = self.job_tx.clone();
                let retry_delay = self.retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(retry_delay).await;
                    // Send failure means the manager shut down; the job is
                    // dropped, which is exactly the cancellation contract.
                    let _ = job_tx.send(job);
                });
            }
        }
    }
}

/// Handle for queueing registration work. Cheap to clone.
#[derive(Clone)]
pub struct RegistrationManager {
    job_tx: mpsc::UnboundedSender<Job>,
    health: Arc<Health>,
    events: broadcast::Sender<RegistrationEvent>,
    cancel: Arc<watch::Sender<bool>>,
}

impl RegistrationManager {
    pub fn new() -> Self {
        Self::with_retry_delay(DEFAULT_RETRY_DELAY)
    }

    pub fn with_retry_delay(retry_delay: Duration) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let health = Arc::new(Health::default());
        let actor = RegistrationActor {
            health: health.clone(),
            retry_delay,
            job_tx: job_tx.clone(),
            events: events.clone(),
        };
        tokio::spawn(actor.run(job_rx, cancel_rx));
        RegistrationManager { job_tx, health, events, cancel: Arc::new(cancel) }
    }

    /// Subscribe to job lifecycle events. Listeners that fall behind miss
    /// events; they never slow the worker down.
    pub fn events(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.events.subscribe()
    }

    /// Queue one registration job: a directory call plus its local
    /// success-side effects. Returns immediately; the job retries until it
    /// succeeds or the manager shuts down.
    pub fn submit<F, Fut>(&self, description: impl Into<String>, call: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job = Job {
            description: description.into(),
            call: Arc::new(move || Box::pin(call()) as Pin<Box<dyn Future<Output = Result<()>> + Send>>),
            retrying: false,
        };
        self.health.pending.fetch_add(1, Ordering::SeqCst);
        // The queue is unbounded, so the only way to lose a job is
        // submitting after shutdown — which is the cancellation contract.
        if self.job_tx.send(job).is_err() {
            self.health.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("registration job dropped: manager is shut down");
        }
    }

    /// True iff no job is currently in a failed/retrying state.
    pub fn is_registration_ok(&self) -> bool {
        self.health.failed.load(Ordering::SeqCst) == 0
    }

    /// Jobs submitted but not yet confirmed successful.
    pub fn pending_count(&self) -> usize {
        self.health.pending.load(Ordering::SeqCst)
    }

    /// Cancel all queued and retrying jobs and interrupt any in-flight
    /// call. Takes effect immediately: jobs already in the queue never run.
    pub fn shutdown(&self) {
        // Never blocks; retry timers fail to resubmit once the actor is gone.
        let _ = self.cancel.send(true);
    }
}

impl Default for RegistrationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicBool;
    use tokio::time::{sleep, timeout, Duration};

    const SHORT_RETRY: Duration = Duration::from_millis(25);

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn successful_job_completes_and_clears_pending() {
        let manager = RegistrationManager::with_retry_delay(SHORT_RETRY);
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();

        manager.submit("registerPublisher /chatter", move || {
            let done = done_clone.clone();
            async move {
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        wait_until(|| manager.pending_count() == 0).await;
        assert!(done.load(Ordering::SeqCst));
        assert!(manager.is_registration_ok());
    }

    #[tokio::test]
    async fn failing_job_retries_until_success() {
        let manager = RegistrationManager::with_retry_delay(SHORT_RETRY);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        manager.submit("registerSubscriber /chatter", move || {
            let attempts = attempts_clone.clone();
            async move {
                // Fail twice, then succeed: the master came back.
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    bail!("connection refused");
                }
                Ok(())
            }
        });

        wait_until(|| manager.pending_count() == 0).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(manager.is_registration_ok());
    }

    #[tokio::test]
    async fn health_flag_tracks_retrying_jobs() {
        let manager = RegistrationManager::with_retry_delay(Duration::from_secs(3600));
        assert!(manager.is_registration_ok());

        manager.submit("registerService /srv", || async { bail!("unreachable") });

        wait_until(|| !manager.is_registration_ok()).await;
        // Still pending: the job is parked on its retry timer, not dropped.
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn one_stuck_job_does_not_block_the_queue() {
        let manager = RegistrationManager::with_retry_delay(Duration::from_secs(3600));
        manager.submit("registerPublisher /dead", || async { bail!("unreachable") });

        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        manager.submit("registerPublisher /alive", move || {
            let done = done_clone.clone();
            async move {
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        wait_until(|| done.load(Ordering::SeqCst)).await;
        // The stuck job still counts against health and pending.
        assert!(!manager.is_registration_ok());
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn jobs_drain_fifo() {
        let manager = RegistrationManager::with_retry_delay(SHORT_RETRY);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            manager.submit(format!("job {}", i), move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                }
            });
        }

        wait_until(|| manager.pending_count() == 0).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn lifecycle_events_report_failure_then_success() {
        let manager = RegistrationManager::with_retry_delay(SHORT_RETRY);
        let mut events = manager.events();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        manager.submit("registerPublisher /chatter", move || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    bail!("connection refused");
                }
                Ok(())
            }
        });

        let first = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(first, RegistrationEvent::Failed { ref description }
            if description == "registerPublisher /chatter"));
        let second = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(second, RegistrationEvent::Succeeded { .. }));
    }

    #[tokio::test]
    async fn bursts_of_submissions_are_never_dropped() {
        let manager = RegistrationManager::with_retry_delay(SHORT_RETRY);

        // Park the worker so everything behind the first job queues up.
        manager.submit("registerPublisher /slow", || async {
            sleep(Duration::from_millis(100)).await;
            Ok(())
        });

        let completed = Arc::new(AtomicUsize::new(0));
        for i in 0..200 {
            let completed = completed.clone();
            manager.submit(format!("registerPublisher /burst{}", i), move || {
                let completed = completed.clone();
                async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        wait_until(|| completed.load(Ordering::SeqCst) == 200).await;
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.is_registration_ok());
    }

    #[tokio::test]
    async fn shutdown_drops_queued_jobs_and_interrupts_in_flight_work() {
        let manager = RegistrationManager::with_retry_delay(SHORT_RETRY);

        // First job parks forever once it has started running.
        let started = Arc::new(AtomicBool::new(false));
        let started_clone = started.clone();
        manager.submit("registerPublisher /stuck", move || {
            let started = started_clone.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        });

        // Second job waits in the queue behind it.
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        manager.submit("registerPublisher /queued", move || {
            let ran = ran_clone.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        wait_until(|| started.load(Ordering::SeqCst)).await;
        manager.shutdown();
        sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst), "queued job ran after shutdown");
    }

    #[tokio::test]
    async fn shutdown_cancels_retrying_jobs() {
        let manager = RegistrationManager::with_retry_delay(Duration::from_millis(10));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        manager.submit("registerPublisher /chatter", move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                bail!("unreachable")
            }
        });

        wait_until(|| attempts.load(Ordering::SeqCst) >= 1).await;
        manager.shutdown();
        sleep(Duration::from_millis(100)).await;
        let after_shutdown = attempts.load(Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        // No further attempts once the actor is gone.
        assert_eq!(attempts.load(Ordering::SeqCst), after_shutdown);
    }
}
