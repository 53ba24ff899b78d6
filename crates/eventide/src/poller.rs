//! Poll loop
//!
//! Single-flight loop that drains the queue into the pipeline. At most one
//! activation exists at a time; dispatchers that need a later version bump
//! `min_version` and the running pass keeps going until it is covered.
//!
//! Each event is processed inside one write transaction: a stale-version
//! re-check (another process may have won the race), a `handle` savepoint
//! around the pipeline, rollback plus `result` → `failed_result` on error,
//! and the outcome upserted into the queue row. Failures increment an error
//! counter; the loop closes all store handles (they reopen lazily), sleeps
//! `retry_backoff × errors` and retries the same version, surrendering
//! after `max_retries` consecutive failures.
//!
//! Engines opened read-only run a version-watch variant instead: they poll
//! the persisted version and sweep waiters from the queue without ever
//! opening a write transaction.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use eventide_core::{Event, Result, Version};
use eventide_sqlite::SqliteStore;

use crate::observer::ObserverHub;
use crate::pipeline::EventPipeline;
use crate::queue::EventQueue;
use crate::version::VersionTracker;
use crate::waiter::WaiterSet;

pub(crate) struct PollLoop {
    inner: Arc<PollInner>,
}

pub(crate) struct PollInner {
    pub queue: EventQueue,
    pub rw_store: SqliteStore,
    pub ro_store: SqliteStore,
    pub version: Arc<VersionTracker>,
    pub pipeline: EventPipeline,
    pub waiters: Arc<WaiterSet>,
    pub observers: ObserverHub,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub max_retries: u32,
    pub stop_on_error: bool,
    pub read_only: bool,
    pub queue_shares_rw: bool,
    state: Mutex<LoopState>,
    shutdown: Notify,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    polling: bool,
    stop: bool,
    min_version: Option<Version>,
    fatal: Option<Version>,
    task: Option<JoinHandle<()>>,
}

#[allow(clippy::too_many_arguments)]
impl PollLoop {
    pub fn new(
        queue: EventQueue,
        rw_store: SqliteStore,
        ro_store: SqliteStore,
        version: Arc<VersionTracker>,
        pipeline: EventPipeline,
        waiters: Arc<WaiterSet>,
        observers: ObserverHub,
        poll_interval: Duration,
        retry_backoff: Duration,
        max_retries: u32,
        stop_on_error: bool,
        read_only: bool,
    ) -> Self {
        let queue_shares_rw = queue.store().same_store(&rw_store);
        Self {
            inner: Arc::new(PollInner {
                queue,
                rw_store,
                ro_store,
                version,
                pipeline,
                waiters,
                observers,
                poll_interval,
                retry_backoff,
                max_retries,
                stop_on_error,
                read_only,
                queue_shares_rw,
                state: Mutex::new(LoopState::default()),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Make sure a loop activation is running and will not exit before
    /// `min_version` is handled. Must be called from a tokio runtime.
    pub fn ensure_running(&self, min_version: Option<Version>) {
        let mut state = self.inner.state.lock();
        if let Some(v) = min_version {
            state.min_version = Some(state.min_version.map_or(v, |m| m.max(v)));
        }
        if state.stop || state.fatal.is_some() || state.running {
            return;
        }
        state.running = true;
        let inner = self.inner.clone();
        state.task = Some(tokio::spawn(async move {
            if inner.read_only {
                run_watch_loop(&inner).await;
            } else {
                run_drain_loop(&inner).await;
            }
        }));
    }

    /// Switch continuous polling on; the loop then blocks on the queue
    /// instead of exiting when it drains.
    pub fn set_polling(&self, polling: bool) {
        self.inner.state.lock().polling = polling;
        if polling {
            self.ensure_running(None);
        }
    }

    /// The version the loop gave up on, if it has surrendered.
    pub fn fatal_version(&self) -> Option<Version> {
        self.inner.state.lock().fatal
    }

    /// Stop the loop and wait for the current pass to finish. Processing of
    /// the in-flight event completes; there is no mid-event cancellation.
    /// Stopping is terminal: pending waiters resolve to `Closed`.
    pub async fn stop(&self) {
        let task = {
            let mut state = self.inner.state.lock();
            state.stop = true;
            state.task.take()
        };
        self.inner.shutdown.notify_waiters();
        self.inner.queue.wake();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.waiters.fail_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stop
    }
}

enum IterationOutcome {
    /// Keep draining.
    Continue,
    /// The queue is drained (non-blocking pass found nothing).
    Drained,
    /// `stop_on_error` tripped; leave the loop without retrying.
    Stop,
}

async fn run_drain_loop(inner: &Arc<PollInner>) {
    tracing::debug!("poll loop started");
    let mut last_v: Version = 0;
    let mut errs: u32 = 0;

    loop {
        {
            let mut state = inner.state.lock();
            if state.stop {
                state.running = false;
                return;
            }
            if let Some(min) = state.min_version {
                if min <= last_v {
                    state.min_version = None;
                    if !state.polling {
                        state.running = false;
                        return;
                    }
                }
            }
        }

        if errs > 0 {
            if errs > inner.max_retries {
                let failed_v = last_v + 1;
                tracing::error!(v = failed_v, "giving up on event");
                {
                    let mut state = inner.state.lock();
                    state.fatal = Some(failed_v);
                    state.running = false;
                }
                // fatal is visible before the waiters drop, so late
                // registrants either see it or get swept here
                inner.waiters.fail_all();
                return;
            }
            tracing::warn!(errs, v = last_v + 1, "backing off before retry");
            inner.rw_store.close();
            inner.ro_store.close();
            inner.queue.close();
            tokio::select! {
                _ = tokio::time::sleep(inner.retry_backoff * errs) => {}
                _ = inner.shutdown.notified() => continue,
            }
        }

        match run_iteration(inner, &mut last_v, &mut errs).await {
            Ok(IterationOutcome::Continue) => {}
            Ok(IterationOutcome::Drained) => {
                let mut state = inner.state.lock();
                let keep_going =
                    state.polling || state.min_version.map_or(false, |min| min > last_v);
                if !keep_going || state.stop {
                    state.running = false;
                    return;
                }
            }
            Ok(IterationOutcome::Stop) => {
                let mut state = inner.state.lock();
                state.running = false;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "poll iteration failed");
                errs += 1;
            }
        }
    }
}

async fn run_iteration(
    inner: &Arc<PollInner>,
    last_v: &mut Version,
    errs: &mut u32,
) -> Result<IterationOutcome> {
    let current = inner.version.get().await?;

    // another process may have advanced the version past local waiters
    if current > *last_v {
        inner.waiters.sweep_up_to(current, &inner.queue);
        *last_v = current;
    }

    let no_block = {
        let state = inner.state.lock();
        !state.polling && state.min_version.is_none()
    };

    let event = tokio::select! {
        event = inner.queue.get_next(current, no_block) => event?,
        _ = inner.shutdown.notified() => return Ok(IterationOutcome::Drained),
    };
    let mut event = match event {
        Some(event) => event,
        None => return Ok(IterationOutcome::Drained),
    };

    let processed = process_event(inner, &mut event);
    if !processed {
        // raced: another process handled this version first
        return Ok(IterationOutcome::Continue);
    }

    if event.is_error() {
        *errs += 1;
        *last_v = event.v - 1;
        tracing::warn!(v = event.v, event_type = %event.event_type, "event failed");
    } else {
        *errs = 0;
        *last_v = event.v;
        tracing::debug!(v = event.v, event_type = %event.event_type, "event handled");
    }

    inner.waiters.notify(&event, &inner.queue);
    inner.observers.emit(&event);

    if event.is_error() && inner.stop_on_error {
        return Ok(IterationOutcome::Stop);
    }
    Ok(IterationOutcome::Continue)
}

/// Process one event inside a write transaction. Returns `false` when the
/// event had already been handled by the time the transaction opened.
///
/// Pipeline errors commit normally (the savepoint rolled their writes
/// back but the queue row keeps the error map). A failure of the
/// transaction machinery itself is tagged `_SQLite` on the event and the
/// row is persisted best-effort outside the dead transaction.
fn process_event(inner: &PollInner, event: &mut Event) -> bool {
    let outcome = inner.rw_store.with_transaction(|txn| {
        let current = txn.user_version()?;
        if event.v <= current {
            return Ok(false);
        }

        event.error = None;
        event.result = None;
        event.failed_result = None;

        txn.savepoint("handle")?;
        inner.pipeline.handle(txn, event, 0);
        if event.is_error() {
            txn.rollback_to_savepoint("handle")?;
            txn.release_savepoint("handle")?;
            if let Some(result) = event.result.take() {
                event.failed_result = Some(result);
            }
        } else {
            txn.release_savepoint("handle")?;
        }

        if inner.queue_shares_rw {
            inner.queue.set_in_txn(txn, event)?;
        } else {
            inner.queue.set(event)?;
        }
        Ok(true)
    });

    match outcome {
        Ok(processed) => processed,
        Err(e) => {
            event.set_error("_SQLite", e.to_string());
            if let Some(result) = event.result.take() {
                event.failed_result = Some(result);
            }
            if let Err(set_err) = inner.queue.set(event) {
                tracing::warn!(v = event.v, error = %set_err, "failed to persist error row");
            }
            true
        }
    }
}

/// Loop variant for read-only engines: watch the persisted version and
/// sweep waiters; exit once nothing is waiting.
async fn run_watch_loop(inner: &Arc<PollInner>) {
    tracing::debug!("version watch loop started");
    loop {
        {
            let mut state = inner.state.lock();
            if state.stop {
                state.running = false;
                return;
            }
        }

        match inner.version.get().await {
            Ok(current) => {
                inner.waiters.sweep_up_to(current, &inner.queue);
                let mut state = inner.state.lock();
                let covered = state.min_version.map_or(true, |min| min <= current);
                if covered {
                    state.min_version = None;
                }
                if covered && !state.polling && !inner.waiters.has_pending() {
                    state.running = false;
                    return;
                }
            }
            Err(e) => tracing::warn!(error = %e, "version read failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.poll_interval) => {}
            _ = inner.shutdown.notified() => {}
        }
    }
}
