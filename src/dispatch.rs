//! Single-flight send dispatcher.
//!
//! One dedicated OS thread runs a current-thread tokio runtime and is the
//! only place where the transport is called, so at most one send is ever
//! in flight. Producers hand triggers over through a mutex-guarded pending
//! queue and a [`Notify`]; each trigger is answered with a [`SendHandle`].
//!
//! ```text
//! on_event ─► submit ─► pending queue ─► worker: snapshot ─► compose ─► transport
//!                                                    │
//!                                        SendHandle + StatusEvent
//! ```
//!
//! # Overlap
//!
//! Triggers arriving while a send is in flight are governed by
//! [`OverlapPolicy`]: `coalesce` keeps a single pending send that later
//! triggers fold into, `queue` keeps up to `max_pending` distinct ones.
//! In both cases the buffer snapshot is taken when the send starts.
//!
//! # Shutdown
//!
//! [`Dispatcher::stop`] closes the queue, cancels pending sends, waits
//! up to the shutdown grace period for the in-flight one and aborts it
//! if it is still running.

use crate::buffer::CyclicBuffer;
use crate::compose::Composer;
use crate::config::{OverlapPolicy, RuntimeConfig};
use crate::error::{AppendError, ConfigError, SendError, WaitError};
use crate::event::LogEvent;
use crate::transport::MailTransport;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Buffer shared between producers and the dispatch worker.
pub type SharedBuffer = Arc<Mutex<CyclicBuffer>>;

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 64;

const WORKER_THREAD_NAME: &str = "logmailer-dispatch";

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Send handle
// =============================================================================

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub success: bool,
    pub error: Option<SendError>,
    /// Events rendered in the message (0 if composition never ran).
    pub events: usize,
    /// Triggers answered by this send, coalesced ones included.
    pub triggers: u64,
    pub completed_at: DateTime<Utc>,
}

impl SendOutcome {
    fn succeeded(events: usize, triggers: u64) -> Self {
        Self {
            success: true,
            error: None,
            events,
            triggers,
            completed_at: Utc::now(),
        }
    }

    fn failed(error: SendError, events: usize, triggers: u64) -> Self {
        Self {
            success: false,
            error: Some(error),
            events,
            triggers,
            completed_at: Utc::now(),
        }
    }
}

/// Lifecycle of a send as seen through its handle.
#[derive(Debug, Clone, PartialEq)]
pub enum SendStatus {
    Pending,
    InFlight,
    Completed(SendOutcome),
}

struct HandleInner {
    id: u64,
    status: Mutex<SendStatus>,
    done: Condvar,
    notify: Notify,
    cancel: CancellationToken,
    triggers: AtomicU64,
}

/// Awaitable, cancellable handle on a triggered send.
///
/// Cheap to clone; every clone observes the same send. The worker
/// completes the handle exactly once.
#[derive(Clone)]
pub struct SendHandle {
    inner: Arc<HandleInner>,
}

impl SendHandle {
    fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                status: Mutex::new(SendStatus::Pending),
                done: Condvar::new(),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                triggers: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> SendStatus {
        lock(&self.inner.status).clone()
    }

    pub fn is_done(&self) -> bool {
        matches!(*lock(&self.inner.status), SendStatus::Completed(_))
    }

    /// Outcome of the send, once completed.
    pub fn outcome(&self) -> Option<SendOutcome> {
        match &*lock(&self.inner.status) {
            SendStatus::Completed(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Number of triggers folded into this send so far.
    pub fn triggers(&self) -> u64 {
        self.inner.triggers.load(Ordering::SeqCst)
    }

    /// Wait for completion from async code.
    ///
    /// # Errors
    /// Returns `WaitError::Timeout` if the send is not done within `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<SendOutcome, WaitError> {
        let wait = async {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(outcome) = self.outcome() {
                    return outcome;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| WaitError::Timeout(timeout))
    }

    /// Wait for completion, blocking the current thread.
    ///
    /// # Errors
    /// Returns `WaitError::Timeout` if the send is not done within `timeout`.
    pub fn wait_blocking(&self, timeout: Duration) -> Result<SendOutcome, WaitError> {
        let status = lock(&self.inner.status);
        let (status, _) = self
            .inner
            .done
            .wait_timeout_while(status, timeout, |s| !matches!(s, SendStatus::Completed(_)))
            .unwrap_or_else(PoisonError::into_inner);

        match &*status {
            SendStatus::Completed(outcome) => Ok(outcome.clone()),
            _ => Err(WaitError::Timeout(timeout)),
        }
    }

    /// Block until the worker completes the handle.
    fn join(&self) -> SendOutcome {
        let status = lock(&self.inner.status);
        let status = self
            .inner
            .done
            .wait_while(status, |s| !matches!(s, SendStatus::Completed(_)))
            .unwrap_or_else(PoisonError::into_inner);

        match &*status {
            SendStatus::Completed(outcome) => outcome.clone(),
            _ => SendOutcome::failed(SendError::Cancelled, 0, self.triggers()),
        }
    }

    /// Cancel the send.
    ///
    /// A pending send completes at once with `SendError::Cancelled`; an
    /// in-flight send is aborted by the worker. No effect once completed.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        let mut status = lock(&self.inner.status);
        if *status == SendStatus::Pending {
            *status = SendStatus::Completed(SendOutcome::failed(
                SendError::Cancelled,
                0,
                self.triggers(),
            ));
            drop(status);
            self.wake_waiters();
        }
    }

    /// Count one more trigger into a send that has not started.
    ///
    /// Runs under the status lock, so it cannot interleave with `cancel`
    /// or the worker picking the send up. Returns the new trigger count,
    /// or `None` when the send is no longer pending.
    fn try_fold(&self) -> Option<u64> {
        let status = lock(&self.inner.status);
        if *status != SendStatus::Pending {
            return None;
        }
        Some(self.inner.triggers.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn mark_in_flight(&self) -> bool {
        let mut status = lock(&self.inner.status);
        if *status == SendStatus::Pending {
            *status = SendStatus::InFlight;
            true
        } else {
            false
        }
    }

    fn complete(&self, outcome: SendOutcome) -> bool {
        let mut status = lock(&self.inner.status);
        if matches!(*status, SendStatus::Completed(_)) {
            return false;
        }
        *status = SendStatus::Completed(outcome);
        drop(status);
        self.wake_waiters();
        true
    }

    fn wake_waiters(&self) {
        self.inner.done.notify_all();
        self.inner.notify.notify_waiters();
    }
}

impl fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// State and status channel
// =============================================================================

/// Dispatcher state machine: `Idle → Sending → Idle`, or through `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Sending,
    Failed,
}

impl DispatchState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatchState::Sending,
            2 => DispatchState::Failed,
            _ => DispatchState::Idle,
        }
    }
}

/// Diagnostic events published on the status channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    SendStarted { id: u64, events: usize },
    SendSucceeded { id: u64, events: usize, duration: Duration },
    SendFailed { id: u64, error: SendError },
    TriggerCoalesced { id: u64, triggers: u64 },
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Dispatch tuning taken from the appender configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub overlap: OverlapPolicy,
    pub max_pending: usize,
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl DispatchSettings {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            overlap: config.overlap,
            max_pending: config.max_pending,
            send_timeout: config.send_timeout,
            shutdown_grace: config.shutdown_grace,
        }
    }

    fn pending_limit(&self) -> usize {
        match self.overlap {
            OverlapPolicy::Coalesce => 1,
            OverlapPolicy::Queue => self.max_pending.max(1),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            overlap: OverlapPolicy::Coalesce,
            max_pending: 16,
            send_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Job {
    handle: SendHandle,
    trigger: Arc<LogEvent>,
    /// Owned by a synchronous producer; never folded into.
    exclusive: bool,
}

impl Drop for Job {
    fn drop(&mut self) {
        // pending jobs dropped by stop() end up here
        self.handle.complete(SendOutcome::failed(
            SendError::Cancelled,
            0,
            self.handle.triggers(),
        ));
    }
}

#[derive(Default)]
struct JobQueue {
    pending: VecDeque<Job>,
    closed: bool,
}

struct Shared {
    queue: Mutex<JobQueue>,
    wake: Notify,
    state: AtomicU8,
    next_id: AtomicU64,
    status_tx: broadcast::Sender<StatusEvent>,
    abort: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: DispatchState) {
        self.state.store(state as u8, Ordering::SeqCst);
        tracing::trace!(state = ?state, "Dispatch state changed");
    }

    fn publish(&self, event: StatusEvent) {
        // no subscriber is fine
        let _ = self.status_tx.send(event);
    }
}

struct WorkerThread {
    join: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

/// Owns the dispatch worker thread.
pub struct Dispatcher {
    shared: Arc<Shared>,
    settings: DispatchSettings,
    worker: Mutex<Option<WorkerThread>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    /// Spawn the worker thread.
    ///
    /// # Errors
    /// Returns `ConfigError::Startup` if the runtime or thread cannot be created.
    pub fn start(
        settings: DispatchSettings,
        buffer: SharedBuffer,
        composer: Arc<Composer>,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self, ConfigError> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue::default()),
            wake: Notify::new(),
            state: AtomicU8::new(DispatchState::Idle as u8),
            next_id: AtomicU64::new(1),
            status_tx,
            abort: CancellationToken::new(),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ConfigError::Startup(format!("dispatch runtime: {}", e)))?;

        let worker = Worker {
            shared: Arc::clone(&shared),
            settings,
            buffer,
            composer,
            transport,
        };

        let (done_tx, done) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(worker.run());
                let _ = done_tx.send(());
            })
            .map_err(|e| ConfigError::Startup(format!("dispatch thread: {}", e)))?;

        tracing::debug!(
            overlap = ?settings.overlap,
            max_pending = settings.max_pending,
            send_timeout = ?settings.send_timeout,
            "Dispatcher started"
        );

        Ok(Self {
            shared,
            settings,
            worker: Mutex::new(Some(WorkerThread { join, done })),
            stopped: AtomicBool::new(false),
        })
    }

    /// Current state of the send state machine.
    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Number of sends waiting for the worker.
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.queue).pending.len()
    }

    /// Hand a trigger to the worker, subject to the overlap policy.
    ///
    /// # Errors
    /// Returns `AppendError::Stopped` once the dispatcher is stopping.
    pub fn submit(&self, trigger: Arc<LogEvent>) -> Result<SendHandle, AppendError> {
        self.enqueue(trigger, false)
    }

    /// Hand a trigger to the worker as its own send, never coalesced.
    ///
    /// # Errors
    /// Returns `AppendError::Stopped` once the dispatcher is stopping.
    pub fn submit_exclusive(&self, trigger: Arc<LogEvent>) -> Result<SendHandle, AppendError> {
        self.enqueue(trigger, true)
    }

    /// Submit and block until the send completes.
    ///
    /// # Errors
    /// Returns `AppendError::Stopped` when stopping and `AppendError::Send`
    /// if the send failed.
    pub fn send_blocking(&self, trigger: Arc<LogEvent>) -> Result<SendHandle, AppendError> {
        let handle = self.submit_exclusive(trigger)?;
        settle(handle)
    }

    fn enqueue(&self, trigger: Arc<LogEvent>, exclusive: bool) -> Result<SendHandle, AppendError> {
        let mut queue = lock(&self.shared.queue);
        if queue.closed {
            return Err(AppendError::Stopped);
        }

        if !exclusive && queue.pending.len() >= self.settings.pending_limit() {
            let folded = queue
                .pending
                .iter_mut()
                .rev()
                .filter(|job| !job.exclusive)
                .find_map(|job| {
                    let triggers = job.handle.try_fold()?;
                    job.trigger = Arc::clone(&trigger);
                    Some((job.handle.clone(), triggers))
                });
            if let Some((handle, triggers)) = folded {
                drop(queue);

                tracing::debug!(id = handle.id(), triggers = triggers, "Trigger coalesced into pending send");
                metrics::counter!("logmailer_triggers_coalesced_total").increment(1);
                self.shared.publish(StatusEvent::TriggerCoalesced {
                    id: handle.id(),
                    triggers,
                });
                return Ok(handle);
            }
        }

        let handle = SendHandle::new(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        queue.pending.push_back(Job {
            handle: handle.clone(),
            trigger,
            exclusive,
        });
        let pending = queue.pending.len();
        drop(queue);

        tracing::debug!(id = handle.id(), pending = pending, "Send queued");
        metrics::gauge!("logmailer_pending_sends").set(pending as f64);
        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Stop the worker.
    ///
    /// Pending sends are cancelled; the in-flight send gets the shutdown
    /// grace period, then is aborted. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled: Vec<Job> = {
            let mut queue = lock(&self.shared.queue);
            queue.closed = true;
            queue.pending.drain(..).collect()
        };
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "Cancelling pending sends");
        }
        // completes their handles with SendError::Cancelled
        drop(cancelled);
        metrics::gauge!("logmailer_pending_sends").set(0.0);
        self.shared.wake.notify_one();

        let Some(worker) = lock(&self.worker).take() else {
            return;
        };

        match worker.done.recv_timeout(self.settings.shutdown_grace) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    grace = ?self.settings.shutdown_grace,
                    "In-flight send exceeded shutdown grace period, aborting"
                );
                self.shared.abort.cancel();
            }
        }

        if worker.join.join().is_err() {
            tracing::error!("Dispatch worker panicked");
        }
        tracing::debug!("Dispatcher stopped");
    }
}

/// Block until `handle` completes; a failed send becomes `AppendError::Send`.
pub(crate) fn settle(handle: SendHandle) -> Result<SendHandle, AppendError> {
    match handle.join().error {
        Some(error) => Err(AppendError::Send(error)),
        None => Ok(handle),
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .field("pending", &self.pending_len())
            .finish()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    shared: Arc<Shared>,
    settings: DispatchSettings,
    buffer: SharedBuffer,
    composer: Arc<Composer>,
    transport: Arc<dyn MailTransport>,
}

impl Worker {
    async fn run(self) {
        tracing::debug!("Dispatch worker started");

        loop {
            let (job, closed) = {
                let mut queue = lock(&self.shared.queue);
                (queue.pending.pop_front(), queue.closed)
            };

            match job {
                Some(job) => self.process(job).await,
                None if closed => break,
                None => {
                    tokio::select! {
                        _ = self.shared.wake.notified() => {}
                        _ = self.shared.abort.cancelled() => break,
                    }
                }
            }
        }

        tracing::debug!("Dispatch worker exiting");
    }

    async fn process(&self, job: Job) {
        if !job.handle.mark_in_flight() {
            tracing::debug!(id = job.handle.id(), "Skipping cancelled send");
            return;
        }

        let span = tracing::info_span!("send_mail", send_id = job.handle.id());
        async {
            self.shared.set_state(DispatchState::Sending);
            let start = Instant::now();
            let triggers = job.handle.triggers();

            let snapshot = lock(&self.buffer).snapshot();
            let events = snapshot.len();
            self.shared.publish(StatusEvent::SendStarted {
                id: job.handle.id(),
                events,
            });

            let result = match self.composer.compose(&snapshot, Some(&job.trigger)) {
                Ok(message) => self.deliver(&job, &message).await,
                Err(e) => Err(SendError::Render(e)),
            };
            let duration = start.elapsed();
            metrics::histogram!("logmailer_send_duration_seconds").record(duration.as_secs_f64());

            match result {
                Ok(()) => {
                    tracing::info!(
                        events = events,
                        triggers = triggers,
                        duration_ms = duration.as_millis() as u64,
                        "Mail sent"
                    );
                    metrics::counter!("logmailer_sends_total", "outcome" => "success").increment(1);
                    self.shared.publish(StatusEvent::SendSucceeded {
                        id: job.handle.id(),
                        events,
                        duration,
                    });
                    self.shared.set_state(DispatchState::Idle);
                    job.handle.complete(SendOutcome::succeeded(events, triggers));
                }
                Err(error) => {
                    self.shared.set_state(DispatchState::Failed);
                    tracing::error!(error = %error, events = events, "Mail send failed");
                    metrics::counter!("logmailer_sends_total", "outcome" => "failure").increment(1);
                    self.shared.publish(StatusEvent::SendFailed {
                        id: job.handle.id(),
                        error: error.clone(),
                    });
                    self.shared.set_state(DispatchState::Idle);
                    job.handle.complete(SendOutcome::failed(error, events, triggers));
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver(
        &self,
        job: &Job,
        message: &crate::compose::EmailMessage,
    ) -> Result<(), SendError> {
        let send_timeout = self.settings.send_timeout;
        let send = tokio::time::timeout(send_timeout, self.transport.send(message));

        tokio::select! {
            result = send => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SendError::Transport(e)),
                Err(_) => Err(SendError::Timeout(send_timeout)),
            },
            _ = job.handle.inner.cancel.cancelled() => Err(SendError::Cancelled),
            _ = self.shared.abort.cancelled() => {
                Err(SendError::ShutdownTimeout(self.settings.shutdown_grace))
            }
        }
    }
}
