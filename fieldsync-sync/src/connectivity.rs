//! Connectivity monitor.
//!
//! Turns raw transport events into a debounced, de-duplicated online/offline
//! signal. Only "connected and internet reachable" counts as online.

use crate::config::MonitorConfig;
use crate::error::SyncResult;
use crate::listeners::{Listeners, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    None,
    #[default]
    Unknown,
}

/// One reading from the platform network transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_connected: bool,
    /// `None` while the platform has not determined reachability yet.
    pub is_internet_reachable: Option<bool>,
    pub connection_type: ConnectionType,
}

impl NetworkState {
    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            connection_type,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
            connection_type: ConnectionType::None,
        }
    }

    /// A radio link without confirmed reachability is offline.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable == Some(true)
    }

    fn status(&self) -> ConnectivityStatus {
        if self.is_online() {
            ConnectivityStatus::Online
        } else {
            ConnectivityStatus::Offline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Online,
    Offline,
    /// The transport could not be queried.
    Unknown,
}

/// Delivered to subscribers when the status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub is_online: bool,
    pub connection_type: ConnectionType,
    pub was_online: bool,
    pub status: ConnectivityStatus,
}

/// Platform network transport.
#[async_trait]
pub trait ConnectivityTransport: Send + Sync {
    /// Current network state.
    async fn fetch(&self) -> SyncResult<NetworkState>;

    /// Stream of raw change events. Called once per monitor.
    fn watch(&self) -> SyncResult<mpsc::Receiver<NetworkState>>;
}

/// Synchronous online check consumed by the engine and the orchestrator.
pub trait NetworkProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

struct MonitorState {
    status: ConnectivityStatus,
    connection_type: ConnectionType,
    /// Last status delivered to listeners.
    notified: Option<ConnectivityStatus>,
}

struct Shared {
    state: Mutex<MonitorState>,
    listeners: Listeners<ConnectivityChange>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a new reading and notifies on a status change, or always
    /// when `force` is set.
    fn apply(&self, status: ConnectivityStatus, connection_type: ConnectionType, force: bool) {
        let change = {
            let mut state = self.lock();
            let was_online = state.notified == Some(ConnectivityStatus::Online);
            state.status = status;
            state.connection_type = connection_type;
            if !force && state.notified == Some(status) {
                return;
            }
            state.notified = Some(status);
            ConnectivityChange {
                is_online: status == ConnectivityStatus::Online,
                connection_type,
                was_online,
                status,
            }
        };

        info!(
            "[NET] connectivity {:?} via {:?} (was online: {})",
            change.status, change.connection_type, change.was_online
        );
        self.listeners.notify(&change);
    }
}

/// Debounced connectivity signal with change fan-out.
pub struct ConnectivityMonitor {
    shared: Arc<Shared>,
    transport: Arc<dyn ConnectivityTransport>,
    config: MonitorConfig,
    watcher: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl ConnectivityMonitor {
    pub fn new(transport: Arc<dyn ConnectivityTransport>, config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MonitorState {
                    status: ConnectivityStatus::Unknown,
                    connection_type: ConnectionType::Unknown,
                    notified: None,
                }),
                listeners: Listeners::new("NET"),
            }),
            transport,
            config,
            watcher: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Reads the current status and starts watching the transport.
    /// Later calls are no-ops.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        self.check(false).await;

        match self.transport.watch() {
            Ok(events) => {
                let handle = tokio::spawn(watch_transport(
                    Arc::clone(&self.shared),
                    events,
                    self.config.debounce,
                ));
                *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => warn!("[NET] cannot watch transport, status will only change on refresh: {}", e),
        }
    }

    /// Re-reads the transport immediately, bypassing debounce, and notifies
    /// subscribers with the result.
    pub async fn refresh(&self) -> ConnectivityStatus {
        self.check(true).await
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityChange) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(listener)
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.shared.lock().status
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.shared.lock().connection_type
    }

    pub fn is_online(&self) -> bool {
        self.status() == ConnectivityStatus::Online
    }

    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    async fn check(&self, force: bool) -> ConnectivityStatus {
        let (status, connection_type) = match self.transport.fetch().await {
            Ok(state) => (state.status(), state.connection_type),
            Err(e) => {
                warn!("[NET] transport query failed, status unknown: {}", e);
                (ConnectivityStatus::Unknown, ConnectionType::Unknown)
            }
        };
        self.shared.apply(status, connection_type, force);
        status
    }
}

impl NetworkProbe for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        ConnectivityMonitor::is_online(self)
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}

/// Applies only the last event of each burst, once the burst has been quiet
/// for `debounce`.
async fn watch_transport(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<NetworkState>,
    debounce: Duration,
) {
    let mut pending: Option<NetworkState> = None;
    let settle = tokio::time::sleep(debounce);
    tokio::pin!(settle);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(state) => {
                    debug!("[NET] raw transport event {:?}", state);
                    pending = Some(state);
                    settle.as_mut().reset(Instant::now() + debounce);
                }
                None => {
                    if let Some(state) = pending.take() {
                        shared.apply(state.status(), state.connection_type, false);
                    }
                    debug!("[NET] transport event stream closed");
                    break;
                }
            },
            () = &mut settle, if pending.is_some() => {
                if let Some(state) = pending.take() {
                    shared.apply(state.status(), state.connection_type, false);
                }
            }
        }
    }
}
