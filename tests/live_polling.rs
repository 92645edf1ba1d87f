//! Live acquisition tests: poll cycles, notification streaming, totalizer
//! resets, and the teardown paths a dying link triggers.

use tokio::sync::broadcast;

use fluxmon_ble::endpoint::{
    FLOW_A_UUID, LITERS_A_UUID, LITERS_B_UUID, METER_A_SERVICE_UUID, METER_B_SERVICE_UUID,
};
use fluxmon_ble::{
    AcquisitionMode, EndpointRegistry, Error, Meter, MockTransport, PeripheralIdentity, Session,
    SessionConfig, SessionEvent, SessionState, Signal,
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

#[tokio::test(start_paused = true)]
async fn poll_read_failure_tears_the_session_down() {
    let transport = MockTransport::with_fluxmon_defaults();
    // Cycle one reads the totalizer once; failing the second read kills
    // cycle two.
    transport.fail_read_at(LITERS_A_UUID, 2);

    let session = Session::new(transport);
    let mut events = session.subscribe_events();
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("connect should succeed");

    let first = snapshots.recv().await.expect("cycle one should publish");
    assert!((first.liters_a - 12.34).abs() < 1e-6);

    let alert = wait_for_alert(&mut events).await;
    assert!(matches!(
        alert,
        Error::PollReadFailed {
            signal: Signal::LitersA,
            ..
        }
    ));
    wait_for_state(&mut events, SessionState::Idle).await;
    wait_for_status(&mut events, "Device disconnected").await;

    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.transport().connected_peripheral().is_none());
    assert!(matches!(
        snapshots.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn truncated_sample_keeps_the_previous_reading() {
    let transport = MockTransport::with_fluxmon_defaults();
    // Two bytes cannot carry a float; the sample is dropped, the cycle
    // and the session carry on.
    transport.set_value(METER_A_SERVICE_UUID, LITERS_A_UUID, vec![0x00, 0x00]);

    let session = Session::new(transport);
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("connect should succeed");

    let first = snapshots.recv().await.expect("cycle one should publish");
    assert_eq!(first.liters_a, 0.0);
    assert!((first.flow_a - 0.55).abs() < 1e-6);
    assert_eq!(session.state(), SessionState::Polling);

    // Once the payload heals, the value flows again.
    session
        .transport()
        .set_float(METER_A_SERVICE_UUID, LITERS_A_UUID, 99.5);
    let healed = loop {
        let snapshot = snapshots.recv().await.expect("polling should continue");
        if snapshot.liters_a != 0.0 {
            break snapshot;
        }
    };
    assert!((healed.liters_a - 99.5).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn reset_zeroes_one_bank_and_republishes() {
    let transport = MockTransport::with_fluxmon_defaults();
    transport.set_float(METER_B_SERVICE_UUID, LITERS_B_UUID, 5.0);

    let session = Session::new(transport);
    let mut events = session.subscribe_events();
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("connect should succeed");

    let before = snapshots.recv().await.expect("cycle one should publish");
    assert!((before.liters_a - 12.34).abs() < 1e-6);
    assert!((before.liters_b - 5.0).abs() < 1e-6);

    session.reset_volume(Meter::A).await.expect("reset should succeed");
    wait_for_status(&mut events, "Reset command sent.").await;

    let after = loop {
        let snapshot = snapshots.recv().await.expect("polling should continue");
        if snapshot.liters_a == 0.0 {
            break snapshot;
        }
    };
    // Bank A drops; bank B and the flow reading are untouched.
    assert!((after.liters_b - 5.0).abs() < 1e-6);
    assert!((after.flow_a - 0.55).abs() < 1e-6);

    let writes = session.transport().writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, fluxmon_ble::endpoint::RESET_A_UUID);
    assert_eq!(writes[0].2, vec![fluxmon_ble::codec::RESET_COMMAND]);
}

#[tokio::test(start_paused = true)]
async fn failed_reset_write_changes_nothing() {
    let transport = MockTransport::with_fluxmon_defaults();
    transport.fail_writes(true);

    let session = Session::new(transport);
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("connect should succeed");
    snapshots.recv().await.expect("cycle one should publish");

    let result = session.reset_volume(Meter::A).await;
    assert!(matches!(
        result,
        Err(Error::CommandWriteFailed {
            signal: Signal::ResetA,
            ..
        })
    ));

    // The session stays up and the totalizer keeps its value.
    assert_eq!(session.state(), SessionState::Polling);
    let next = snapshots.recv().await.expect("polling should continue");
    assert!((next.liters_a - 12.34).abs() < 1e-6);
    assert!(session.transport().writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn notify_mode_publishes_per_notification() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::with_config(
        transport,
        EndpointRegistry::fluxmon_v2(),
        SessionConfig::new().with_acquisition(AcquisitionMode::Notify),
    );
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("connect should succeed");
    assert_eq!(session.state(), SessionState::Polling);

    // Wait for the streaming task to subscribe to all five live endpoints.
    while session.transport().subscriptions().len() < 5 {
        tokio::task::yield_now().await;
    }

    session.transport().push_float_notification(LITERS_A_UUID, 42.0);
    let first = snapshots.recv().await.expect("notification should publish");
    assert!((first.liters_a - 42.0).abs() < 1e-6);
    assert_eq!(first.flow_a, 0.0);

    // Unknown characteristics are ignored; state accumulates across events.
    session
        .transport()
        .push_notification(uuid::Uuid::new_v4(), vec![1, 2, 3, 4]);
    session.transport().push_float_notification(FLOW_A_UUID, 1.25);
    let second = snapshots.recv().await.expect("notification should publish");
    assert!((second.flow_a - 1.25).abs() < 1e-6);
    assert!((second.liters_a - 42.0).abs() < 1e-6);

    // Streaming mode never polls; the only reads were the static ones.
    assert_eq!(session.transport().total_reads(), 2);
}

#[tokio::test(start_paused = true)]
async fn subscribe_failure_tears_down_a_streaming_session() {
    let transport = MockTransport::with_fluxmon_defaults();
    transport.fail_subscribe(true);

    let session = Session::with_config(
        transport,
        EndpointRegistry::fluxmon_v2(),
        SessionConfig::new().with_acquisition(AcquisitionMode::Notify),
    );
    let mut events = session.subscribe_events();

    session
        .connect(&meter())
        .await
        .expect("connect itself should succeed");

    let alert = wait_for_alert(&mut events).await;
    assert!(matches!(alert, Error::PollReadFailed { .. }));
    wait_for_state(&mut events, SessionState::Idle).await;
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn external_link_loss_recovers_with_a_fresh_connect() {
    let transport = MockTransport::with_fluxmon_defaults();
    let session = Session::new(transport);
    let mut events = session.subscribe_events();
    let mut snapshots = session.subscribe_snapshots();

    session.connect(&meter()).await.expect("first connect");
    let first = snapshots.recv().await.expect("first link publishes");

    session.transport().drop_link();
    wait_for_state(&mut events, SessionState::Idle).await;
    wait_for_status(&mut events, "Device disconnected").await;
    assert!(session.peripheral().is_none());

    session.connect(&meter()).await.expect("reconnect");
    let resumed = loop {
        let snapshot = snapshots.recv().await.expect("second link publishes");
        if snapshot.generation > first.generation {
            break snapshot;
        }
    };
    assert!((resumed.liters_a - 12.34).abs() < 1e-6);
    assert_eq!(resumed.generation, session.generation());
}
