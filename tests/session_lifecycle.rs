//! End-to-end session lifecycle tests against the scriptable mock transport.
//!
//! Each test runs on a paused clock, so scan windows, radio retries, and
//! poll cadences elapse instantly while staying deterministic.

use tokio::sync::broadcast;

use fluxmon_ble::{
    Advertisement, EndpointRegistry, Error, MockTransport, PeripheralIdentity, Session,
    SessionConfig, SessionEvent, SessionState,
};

/// Identity the default mock advertises.
fn meter() -> PeripheralIdentity {
    PeripheralIdentity::new("mock-meter-1", SessionConfig::DEFAULT_DEVICE_NAME)
}

async fn wait_for_state(events: &mut broadcast::Receiver<SessionEvent>, target: SessionState) {
    loop {
        match events.recv().await.expect("event channel closed early") {
            SessionEvent::StateChanged(state) if state == target => return,
            _ => {}
        }
    }
}

async fn wait_for_status(events: &mut broadcast::Receiver<SessionEvent>, needle: &str) {
    loop {
        match events.recv().await.expect("event channel closed early") {
            SessionEvent::Status(message) if message == needle => return,
            _ => {}
        }
    }
}

async fn wait_for_alert(events: &mut broadcast::Receiver<SessionEvent>) -> Error {
    loop {
        match events.recv().await.expect("event channel closed early") {
            SessionEvent::Alert(error) => return error,
            _ => {}
        }
    }
}

async fn wait_for_results(
    events: &mut broadcast::Receiver<SessionEvent>,
    count: usize,
) -> Vec<Advertisement> {
    loop {
        match events.recv().await.expect("event channel closed early") {
            SessionEvent::ScanResults(results) if results.len() >= count => return results,
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn full_session_reaches_live_data_and_survives_link_loss() {
    let transport = MockTransport::with_fluxmon_defaults();
    // Static reads are 1-2, cycle one is reads 3-7. Losing the link after
    // read 9 kills cycle two before it can publish.
    transport.drop_link_after_reads(9);

    let session = Session::new(transport);
    let mut events = session.subscribe_events();
    let mut snapshots = session.subscribe_snapshots();

    session.start_scan().await.expect("scan should start");
    assert_eq!(session.state(), SessionState::Scanning);

    let results = wait_for_results(&mut events, 1).await;
    assert_eq!(results[0].identity, meter());
    assert_eq!(results[0].rssi, Some(-61));

    session
        .connect(&results[0].identity)
        .await
        .expect("connect should succeed");
    assert_eq!(session.state(), SessionState::Polling);
    assert_eq!(session.peripheral(), Some(meter()));
    assert_eq!(session.generation(), 1);

    let info = session.static_info();
    assert_eq!(info.serial_number, "SN-001");
    assert_eq!(info.lot_code, "B7");
    assert_eq!(info.expiry, "2027-05-01");

    let snapshot = snapshots.recv().await.expect("first cycle should publish");
    assert!((snapshot.liters_a - 12.34).abs() < 1e-6);
    assert!((snapshot.flow_a - 0.55).abs() < 1e-6);
    assert!((snapshot.supply_voltage - 3.301).abs() < 1e-6);
    assert_eq!(snapshot.liters_b, 0.0);
    assert_eq!(snapshot.serial_number, "SN-001");
    assert_eq!(snapshot.generation, 1);

    // The link drops mid-cycle; the session winds down on its own.
    wait_for_state(&mut events, SessionState::Idle).await;
    wait_for_status(&mut events, "Device disconnected").await;
    assert!(session.peripheral().is_none());
    assert!(!session.is_connected());

    // Nothing from the aborted second cycle leaks out.
    assert!(matches!(
        snapshots.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    let last = session.latest_snapshot().expect("cycle one stays recorded");
    assert!((last.liters_a - 12.34).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn scan_filters_by_name_and_keeps_order() {
    let transport = MockTransport::new();
    let session = Session::new(transport);
    let mut events = session.subscribe_events();

    session.start_scan().await.expect("scan should start");

    session
        .transport()
        .advertise(PeripheralIdentity::new("ignored-1", "OtherDevice"), Some(-40));
    session.transport().advertise(
        PeripheralIdentity::new("meter-7", SessionConfig::DEFAULT_DEVICE_NAME),
        Some(-70),
    );
    session.transport().advertise(
        PeripheralIdentity::new("meter-9", SessionConfig::DEFAULT_DEVICE_NAME),
        Some(-80),
    );

    let results = wait_for_results(&mut events, 2).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].identity.id, "meter-7");
    assert_eq!(results[1].identity.id, "meter-9");

    // A repeat advertisement refreshes in place instead of reordering.
    session.transport().advertise(
        PeripheralIdentity::new("meter-7", SessionConfig::DEFAULT_DEVICE_NAME),
        Some(-50),
    );
    session.transport().advertise(
        PeripheralIdentity::new("meter-11", SessionConfig::DEFAULT_DEVICE_NAME),
        Some(-90),
    );

    let results = wait_for_results(&mut events, 3).await;
    assert_eq!(results[0].identity.id, "meter-7");
    assert_eq!(results[0].rssi, Some(-50));
    assert_eq!(results[1].identity.id, "meter-9");
    assert_eq!(results[2].identity.id, "meter-11");

    session.stop_scan().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.transport().is_scanning());
    // Results stay queryable after the scan ends.
    assert_eq!(session.scan_results().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn scan_times_out_on_its_own() {
    let transport = MockTransport::new();
    let session = Session::new(transport);
    let mut events = session.subscribe_events();

    session.start_scan().await.expect("scan should start");
    assert_eq!(session.state(), SessionState::Scanning);
    assert!(session.transport().is_scanning());

    wait_for_status(&mut events, "Scan timeout, stopping scan.").await;
    wait_for_state(&mut events, SessionState::Idle).await;
    assert!(!session.transport().is_scanning());
    assert!(session.scan_results().is_empty());

    // Stopping after the timeout already wound things down is a no-op.
    session.stop_scan().await;
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn repeated_start_scan_is_ignored() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);

    session.start_scan().await.expect("scan should start");
    session.start_scan().await.expect("second start is a quiet no-op");
    assert_eq!(session.state(), SessionState::Scanning);

    session.stop_scan().await;
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_returns_to_idle_and_can_retry() {
    let transport = MockTransport::with_fluxmon_defaults();
    transport.fail_connect("simulated radio interference");

    let session = Session::new(transport);
    let mut events = session.subscribe_events();

    let result = session.connect(&meter()).await;
    assert!(matches!(result, Err(Error::ConnectFailed { .. })));

    wait_for_state(&mut events, SessionState::Error).await;
    wait_for_state(&mut events, SessionState::Idle).await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.peripheral().is_none());

    // The failure was injected once; a retry goes through.
    session.connect(&meter()).await.expect("retry should succeed");
    assert_eq!(session.state(), SessionState::Polling);
}

#[tokio::test(start_paused = true)]
async fn connect_to_unknown_peripheral_fails() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);

    let ghost = PeripheralIdentity::new("never-seen", SessionConfig::DEFAULT_DEVICE_NAME);
    let result = session.connect(&ghost).await;
    assert!(matches!(result, Err(Error::PeripheralNotFound { .. })));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn discovery_rejects_a_mismatched_layout() {
    // The mock serves the dual-bank layout; asking for the legacy compact
    // layout must fail during discovery validation.
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::with_config(transport, EndpointRegistry::compact(), SessionConfig::new());
    let mut events = session.subscribe_events();

    let result = session.connect(&meter()).await;
    assert!(matches!(result, Err(Error::DiscoveryFailed { .. })));

    let alert = wait_for_alert(&mut events).await;
    assert!(matches!(alert, Error::DiscoveryFailed { .. }));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connect_attempts_resolve_to_one_link() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);

    let target = meter();
    let (first, second) = tokio::join!(session.connect(&target), session.connect(&target));

    assert!(first.is_ok());
    assert!(matches!(second, Err(Error::ConnectFailed { .. })));
    assert_eq!(session.state(), SessionState::Polling);
    // Only the winning attempt claimed a generation.
    assert_eq!(session.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);

    session.connect(&meter()).await.expect("connect should succeed");
    let live_generation = session.generation();

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.generation() > live_generation);
    let settled = session.generation();

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.generation(), settled);
}

#[tokio::test(start_paused = true)]
async fn generation_only_moves_forward() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);

    session.connect(&meter()).await.expect("first connect");
    let first = session.generation();

    session.disconnect().await;
    assert!(session.generation() > first);

    session.connect(&meter()).await.expect("second connect");
    let second = session.generation();
    assert!(second > first);

    // Replacing a live link tears down and reclaims in one call.
    session.connect(&meter()).await.expect("replacement connect");
    assert!(session.generation() > second);
    assert_eq!(session.state(), SessionState::Polling);
}

#[tokio::test(start_paused = true)]
async fn replacing_a_live_link_restarts_acquisition() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("first connect");
    let snapshot = snapshots.recv().await.expect("first link publishes");
    assert_eq!(snapshot.generation, session.generation());
    let old_generation = snapshot.generation;

    session.connect(&meter()).await.expect("replacement connect");
    let replacement_generation = session.generation();
    assert!(replacement_generation > old_generation);

    // Snapshots from the replacement link carry the new generation; any
    // stragglers from the old one never carry a newer stamp than it had.
    loop {
        let snapshot = snapshots.recv().await.expect("replacement link publishes");
        if snapshot.generation == replacement_generation {
            break;
        }
        assert!(snapshot.generation <= old_generation);
    }
}
