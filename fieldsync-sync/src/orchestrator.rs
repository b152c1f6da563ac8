//! Auto-sync orchestrator: decides when the engine runs.
//!
//! Triggers come from connectivity restoration, manual user action and the
//! OS background scheduler. Automatic attempts respect a cooldown; a failed
//! attempt is retried on an exponential backoff timer up to a fixed number of
//! times. Retry state lives in memory only, so a restart starts from zero.

use crate::config::AutoSyncConfig;
use crate::connectivity::{ConnectivityMonitor, NetworkProbe};
use crate::engine::{OperationError, SkipReason, SyncEngine, SyncOutcome};
use crate::error::SyncResult;
use crate::flight::SingleFlight;
use crate::handlers::Credential;
use crate::listeners::{Listeners, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events emitted to orchestrator subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSyncEvent {
    /// The engine accepted the attempt; always followed by a completion or
    /// an error.
    SyncStarted,
    SyncCompleted {
        synced_count: usize,
        errors: Vec<OperationError>,
    },
    SyncError {
        error: String,
    },
    SyncRetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    SyncGaveUp,
}

/// Result of a trigger entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Skipped(SkipReason),
    Completed { synced: usize },
    Failed { error: String },
}

impl TriggerOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TriggerOutcome::Skipped(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TriggerOutcome::Completed { .. })
    }
}

/// Snapshot returned by [`AutoSyncOrchestrator::get_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSyncState {
    pub is_auto_syncing: bool,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub auto_retry_count: u32,
    pub can_sync: bool,
    pub has_credential: bool,
}

/// Read-through cache that is refreshed after each successful sync.
#[async_trait]
pub trait PreloadHook: Send + Sync {
    fn set_credential(&self, credential: Option<&Credential>);

    async fn refresh(&self) -> SyncResult<()>;
}

/// Owned handle of the single pending retry. Dropping it cancels the retry.
struct RetryTimer {
    seq: u64,
    handle: Option<JoinHandle<()>>,
}

impl RetryTimer {
    /// Lets the timer task finish on its own; used by the task itself.
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct RetryState {
    /// Monotonic time of the last attempt, for the cooldown.
    last_attempt: Option<Instant>,
    last_attempt_at: Option<DateTime<Utc>>,
    retry_count: u32,
    retry_timer: Option<RetryTimer>,
    is_auto_syncing: bool,
    credential: Option<Credential>,
    timer_seq: u64,
    connectivity: Option<Subscription>,
    destroyed: bool,
}

impl RetryState {
    fn begin_attempt(&mut self) {
        self.is_auto_syncing = true;
        self.last_attempt = Some(Instant::now());
        self.last_attempt_at = Some(Utc::now());
    }
}

struct Inner {
    engine: Arc<SyncEngine>,
    network: Arc<dyn NetworkProbe>,
    preload: Option<Arc<dyn PreloadHook>>,
    config: AutoSyncConfig,
    state: Mutex<RetryState>,
    listeners: Listeners<AutoSyncEvent>,
    preloading: SingleFlight,
}

/// Clears the in-flight flag when an attempt ends, however it ends.
struct AttemptGuard<'a>(&'a Inner);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().is_auto_syncing = false;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one attempt. The caller has already called `begin_attempt`.
    async fn perform_sync(self: &Arc<Self>) -> TriggerOutcome {
        let attempt = AttemptGuard(self);
        let outcome = self
            .engine
            .start_sync_with(|| self.listeners.notify(&AutoSyncEvent::SyncStarted))
            .await;
        drop(attempt);

        match outcome {
            SyncOutcome {
                reason: Some(SkipReason::AlreadySyncing),
                ..
            } => {
                debug!("[AUTOSYNC] engine already syncing, attempt skipped");
                TriggerOutcome::Skipped(SkipReason::AlreadySyncing)
            }
            SyncOutcome {
                reason: Some(SkipReason::Offline),
                ..
            } => self.finish_success(0, Vec::new()),
            SyncOutcome {
                success: true,
                synced,
                errors,
                ..
            } => self.finish_success(synced, errors),
            failed => {
                let error = describe_failure(&failed);
                warn!("[AUTOSYNC] sync attempt failed: {}", error);
                self.listeners.notify(&AutoSyncEvent::SyncError {
                    error: error.clone(),
                });
                self.schedule_retry();
                TriggerOutcome::Failed { error }
            }
        }
    }

    fn finish_success(self: &Arc<Self>, synced: usize, errors: Vec<OperationError>) -> TriggerOutcome {
        self.spawn_preload();
        self.lock().retry_count = 0;
        info!("[AUTOSYNC] sync completed, {} operation(s) synced", synced);
        self.listeners.notify(&AutoSyncEvent::SyncCompleted {
            synced_count: synced,
            errors,
        });
        TriggerOutcome::Completed { synced }
    }

    fn spawn_preload(self: &Arc<Self>) {
        let Some(hook) = self.preload.clone() else {
            return;
        };
        if self.preloading.is_active() {
            debug!("[AUTOSYNC] preload already running");
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Some(_running) = inner.preloading.try_begin() else {
                return;
            };
            if let Err(e) = hook.refresh().await {
                warn!("[AUTOSYNC] preload refresh failed: {}", e);
            }
        });
    }

    /// Schedules the next retry, replacing any pending one, or gives up once
    /// the retry budget is spent.
    fn schedule_retry(self: &Arc<Self>) {
        let scheduled = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            if state.retry_count >= self.config.max_auto_retries {
                None
            } else {
                state.retry_count += 1;
                let attempt = state.retry_count;
                let delay = self.config.backoff.delay(attempt);
                state.timer_seq += 1;
                let seq = state.timer_seq;

                let weak: Weak<Inner> = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.fire_retry(seq).await;
                    }
                });
                state.retry_timer = Some(RetryTimer {
                    seq,
                    handle: Some(handle),
                });
                Some((attempt, delay))
            }
        };

        match scheduled {
            Some((attempt, delay)) => {
                info!("[AUTOSYNC] retry {} scheduled in {:?}", attempt, delay);
                self.listeners
                    .notify(&AutoSyncEvent::SyncRetryScheduled { attempt, delay });
            }
            None => {
                warn!(
                    "[AUTOSYNC] giving up after {} automatic retries",
                    self.config.max_auto_retries
                );
                self.listeners.notify(&AutoSyncEvent::SyncGaveUp);
            }
        }
    }

    /// Timer body. Bypasses the cooldown but not the in-flight check.
    async fn fire_retry(self: &Arc<Self>, seq: u64) {
        {
            let mut state = self.lock();
            match state.retry_timer.take_if(|timer| timer.seq == seq) {
                Some(mut timer) => timer.disarm(),
                None => return,
            }
            if !self.network.is_online() {
                info!("[AUTOSYNC] retry fired while offline, abandoned");
                return;
            }
            if state.is_auto_syncing || self.engine.is_syncing() {
                debug!("[AUTOSYNC] retry fired during a running sync, dropped");
                return;
            }
            state.begin_attempt();
        }
        self.perform_sync().await;
    }
}

fn describe_failure(outcome: &SyncOutcome) -> String {
    if let Some(error) = &outcome.error {
        return error.clone();
    }
    if let Some(reason) = outcome.reason {
        return format!("sync skipped: {reason}");
    }
    match outcome.errors.as_slice() {
        [only] => only.message.clone(),
        errors => format!("{} operation(s) failed", errors.len()),
    }
}

/// Policy layer over the [`SyncEngine`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AutoSyncOrchestrator {
    inner: Arc<Inner>,
}

impl AutoSyncOrchestrator {
    pub fn new(
        engine: Arc<SyncEngine>,
        network: Arc<dyn NetworkProbe>,
        config: AutoSyncConfig,
    ) -> Self {
        Self::build(engine, network, None, config)
    }

    pub fn with_preload(
        engine: Arc<SyncEngine>,
        network: Arc<dyn NetworkProbe>,
        preload: Arc<dyn PreloadHook>,
        config: AutoSyncConfig,
    ) -> Self {
        Self::build(engine, network, Some(preload), config)
    }

    fn build(
        engine: Arc<SyncEngine>,
        network: Arc<dyn NetworkProbe>,
        preload: Option<Arc<dyn PreloadHook>>,
        config: AutoSyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                network,
                preload,
                config,
                state: Mutex::new(RetryState::default()),
                listeners: Listeners::new("AUTOSYNC"),
                preloading: SingleFlight::default(),
            }),
        }
    }

    /// Propagates the credential to the engine and the preload hook.
    pub fn set_credential(&self, credential: Option<Credential>) {
        self.inner.engine.set_credential(credential.clone());
        if let Some(preload) = &self.inner.preload {
            preload.set_credential(credential.as_ref());
        }
        self.inner.lock().credential = credential;
    }

    /// Primary trigger. Skips on cooldown, then when a sync is already
    /// running, then without a credential. Otherwise resets the retry budget
    /// and runs an attempt.
    pub async fn on_connectivity_restored(&self) -> TriggerOutcome {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            if let Some(last) = state.last_attempt
                && last.elapsed() < inner.config.cooldown
            {
                debug!("[AUTOSYNC] trigger skipped: cooldown");
                return TriggerOutcome::Skipped(SkipReason::Cooldown);
            }
            if state.is_auto_syncing || inner.engine.is_syncing() {
                debug!("[AUTOSYNC] trigger skipped: already syncing");
                return TriggerOutcome::Skipped(SkipReason::AlreadySyncing);
            }
            if state.credential.is_none() {
                debug!("[AUTOSYNC] trigger skipped: no credential");
                return TriggerOutcome::Skipped(SkipReason::NoAuth);
            }
            state.retry_count = 0;
            state.retry_timer = None;
            state.begin_attempt();
        }
        inner.perform_sync().await
    }

    /// User-initiated sync: ignores the cooldown and the retry history.
    pub async fn trigger_manual_sync(&self) -> TriggerOutcome {
        {
            let mut state = self.inner.lock();
            state.last_attempt = None;
            state.retry_count = 0;
        }
        self.on_connectivity_restored().await
    }

    /// Entry point for the OS background scheduler.
    pub async fn on_background_tick(&self) -> TriggerOutcome {
        if !self.inner.network.is_online() {
            debug!("[AUTOSYNC] background tick skipped: offline");
            return TriggerOutcome::Skipped(SkipReason::Offline);
        }
        self.on_connectivity_restored().await
    }

    /// Cancels the scheduled retry, if any, and resets the retry count.
    /// A sync that is already running is left alone.
    pub fn cancel_pending_retry(&self) {
        let mut state = self.inner.lock();
        if state.retry_timer.take().is_some() {
            debug!("[AUTOSYNC] pending retry cancelled");
        }
        state.retry_count = 0;
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AutoSyncEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn get_state(&self) -> AutoSyncState {
        let inner = &self.inner;
        let state = inner.lock();
        let has_credential = state.credential.is_some();
        AutoSyncState {
            is_auto_syncing: state.is_auto_syncing,
            last_sync_attempt: state.last_attempt_at,
            auto_retry_count: state.retry_count,
            can_sync: has_credential
                && !state.is_auto_syncing
                && !inner.engine.is_syncing()
                && inner.network.is_online(),
            has_credential,
        }
    }

    /// Runs `on_connectivity_restored` on every offline to online transition
    /// reported by `monitor`. Replaces an earlier attachment.
    pub fn attach(&self, monitor: &ConnectivityMonitor) {
        let weak = Arc::downgrade(&self.inner);
        let subscription = monitor.subscribe(move |change| {
            if !change.is_online || change.was_online {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let outcome = AutoSyncOrchestrator { inner }
                            .on_connectivity_restored()
                            .await;
                        debug!("[AUTOSYNC] connectivity trigger: {:?}", outcome);
                    });
                }
                Err(_) => warn!("[AUTOSYNC] connectivity restored outside a runtime, ignored"),
            }
        });

        let previous = self.inner.lock().connectivity.replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    /// Cancels pending retries, detaches from connectivity and drops all
    /// listeners. Safe to call more than once.
    pub fn destroy(&self) {
        let attachment = {
            let mut state = self.inner.lock();
            state.retry_timer = None;
            state.retry_count = 0;
            state.destroyed = true;
            state.connectivity.take()
        };
        if let Some(attachment) = attachment {
            attachment.unsubscribe();
        }
        self.inner.listeners.clear();
        debug!("[AUTOSYNC] orchestrator destroyed");
    }
}

impl std::fmt::Debug for AutoSyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSyncOrchestrator")
            .field("state", &self.get_state())
            .finish_non_exhaustive()
    }
}
