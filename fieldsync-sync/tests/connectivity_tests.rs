mod support;

use fieldsync_sync::{
    ConnectionType, ConnectivityChange, ConnectivityMonitor, ConnectivityStatus, MonitorConfig,
    NetworkState,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::*;

fn monitor(initial: NetworkState) -> (Arc<MockTransport>, ConnectivityMonitor) {
    init_tracing();
    let transport = MockTransport::new(initial);
    let monitor = ConnectivityMonitor::new(transport.clone(), MonitorConfig::default());
    (transport, monitor)
}

fn record(monitor: &ConnectivityMonitor) -> Arc<Mutex<Vec<ConnectivityChange>>> {
    let seen: Arc<Mutex<Vec<ConnectivityChange>>> = Arc::default();
    let sink = Arc::clone(&seen);
    // Kept for the monitor's lifetime.
    let _ = monitor.subscribe(move |change| sink.lock().unwrap().push(*change));
    seen
}

fn statuses(seen: &Mutex<Vec<ConnectivityChange>>) -> Vec<ConnectivityStatus> {
    seen.lock().unwrap().iter().map(|c| c.status).collect()
}

// ── Initial state ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn initialize_reports_current_status() {
    let (_transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    let seen = record(&monitor);
    assert_eq!(monitor.status(), ConnectivityStatus::Unknown);

    monitor.initialize().await;
    assert!(monitor.is_online());
    assert!(!monitor.is_offline());
    assert_eq!(monitor.connection_type(), ConnectionType::Wifi);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ConnectivityChange {
            is_online: true,
            connection_type: ConnectionType::Wifi,
            was_online: false,
            status: ConnectivityStatus::Online,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn initialize_is_idempotent() {
    let (transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    monitor.initialize().await;
    monitor.initialize().await;
    assert_eq!(transport.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn connected_without_reachability_is_offline() {
    let (_transport, monitor) = monitor(NetworkState {
        is_connected: true,
        is_internet_reachable: None,
        connection_type: ConnectionType::Cellular,
    });
    monitor.initialize().await;
    assert!(monitor.is_offline());
    assert_eq!(monitor.status(), ConnectivityStatus::Offline);
}

// ── Debounce and de-duplication ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn burst_of_events_notifies_once_after_it_settles() {
    let (transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    monitor.initialize().await;
    let seen = record(&monitor);

    transport.emit(NetworkState::offline()).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    transport.emit(NetworkState::online(ConnectionType::Wifi)).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    transport.emit(NetworkState::offline()).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(seen.lock().unwrap().is_empty());
    assert!(monitor.is_online());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(statuses(&seen), vec![ConnectivityStatus::Offline]);
    let change = seen.lock().unwrap()[0];
    assert!(change.was_online);
    assert!(!change.is_online);
    assert!(monitor.is_offline());
}

#[tokio::test(start_paused = true)]
async fn unchanged_status_is_not_renotified() {
    let (transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    monitor.initialize().await;
    let seen = record(&monitor);

    transport.emit(NetworkState::online(ConnectionType::Cellular)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(seen.lock().unwrap().is_empty());
    // The reading is still taken.
    assert_eq!(monitor.connection_type(), ConnectionType::Cellular);
}

#[tokio::test(start_paused = true)]
async fn refresh_bypasses_debounce_and_always_notifies() {
    let (transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    monitor.initialize().await;
    let seen = record(&monitor);

    assert_eq!(monitor.refresh().await, ConnectivityStatus::Online);
    assert_eq!(statuses(&seen), vec![ConnectivityStatus::Online]);
    assert!(seen.lock().unwrap()[0].was_online);

    transport.set_current(NetworkState::offline());
    assert_eq!(monitor.refresh().await, ConnectivityStatus::Offline);
    assert_eq!(
        statuses(&seen),
        vec![ConnectivityStatus::Online, ConnectivityStatus::Offline]
    );
}

// ── Failure handling ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transport_failure_means_unknown_not_an_error() {
    let (transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    transport.fail_fetch(true);
    let seen = record(&monitor);

    monitor.initialize().await;
    assert_eq!(monitor.status(), ConnectivityStatus::Unknown);
    assert!(monitor.is_offline());
    assert_eq!(statuses(&seen), vec![ConnectivityStatus::Unknown]);
    assert!(!seen.lock().unwrap()[0].is_online);

    transport.fail_fetch(false);
    assert_eq!(monitor.refresh().await, ConnectivityStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn monitor_without_event_stream_still_answers_refresh() {
    let transport = MockTransport::new(NetworkState::online(ConnectionType::Ethernet));
    let first = ConnectivityMonitor::new(transport.clone(), MonitorConfig::default());
    let second = ConnectivityMonitor::new(transport.clone(), MonitorConfig::default());
    first.initialize().await;
    second.initialize().await;

    assert!(second.is_online());
    transport.set_current(NetworkState::offline());
    assert_eq!(second.refresh().await, ConnectivityStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_is_isolated() {
    let (_transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    let _bad = monitor.subscribe(|_| panic!("listener bug"));
    let seen = record(&monitor);

    monitor.initialize().await;
    assert_eq!(statuses(&seen), vec![ConnectivityStatus::Online]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_listener_hears_nothing() {
    let (_transport, monitor) = monitor(NetworkState::online(ConnectionType::Wifi));
    let seen: Arc<Mutex<usize>> = Arc::default();
    let sink = Arc::clone(&seen);
    let sub = monitor.subscribe(move |_| *sink.lock().unwrap() += 1);

    monitor.initialize().await;
    sub.unsubscribe();
    monitor.refresh().await;
    assert_eq!(*seen.lock().unwrap(), 1);
}
