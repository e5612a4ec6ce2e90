//! Session protocol tests against a scripted transport on the paused tokio clock

mod common;

use std::time::Duration;

use common::{
    assert_offset, create_test_session, gatt_error, wait_for, wait_for_state, Call, MockTransport,
    TEST_ADDRESS,
};
use gattlink_core::{
    ConnectionState, DescriptorValue, DevicePayload, Operation, Profile, SessionConfig,
    SessionError, SessionEvent, TransportError, TARGET_CHARACTERISTIC_UUID,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{self, Instant};
use uuid::Uuid;

const TARGET: Uuid = TARGET_CHARACTERISTIC_UUID;

fn payload() -> DevicePayload {
    DevicePayload::new(vec![50, 80, 255, 0, 128])
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_start_connects_and_auto_reads_after_settle() {
    let port = MockTransport::with_default_value(b"10,20,30,40,50".to_vec());
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();

    let started = Instant::now();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;
    assert_eq!(port.calls()[0], Call::Connect(TEST_ADDRESS.to_string()));

    wait_for(&mut snapshots, |s| s.payload.is_some()).await;
    let reads = port.reads_since(TARGET, started);
    assert_eq!(reads.len(), 1);
    assert_offset(started, reads[0], 1000);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.payload, Some(DevicePayload::new(vec![10, 20, 30, 40, 50])));
    assert_eq!(snapshot.identity.address, TEST_ADDRESS);
    assert!(snapshot.decode_advisory.is_none());

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_connected_report_reads_once() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let started = Instant::now();

    wait_for_state(&mut snapshots, ConnectionState::Connected).await;
    port.emit_state(ConnectionState::Connected);
    time::sleep(Duration::from_millis(500)).await;
    port.emit_state(ConnectionState::Connected);
    time::sleep(Duration::from_secs(5)).await;

    assert_eq!(port.reads_since(TARGET, started).len(), 1);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_settle_read_failure_is_surfaced() {
    let port = MockTransport::new();
    port.script_reads([Err(TransportError::NotConnected)]);
    let session = create_test_session(&port, SessionConfig::default());
    let mut events = session.subscribe_events();

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        SessionEvent::transport_failure(Operation::AutoRead, "Not connected")
    );
    assert_eq!(event.to_string(), "Auto-read failed: Not connected");

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_falls_back_and_session_stays_usable() {
    let port = MockTransport::new();
    port.script_connect(Err(TransportError::ConnectionFailed("out of range".into())));
    let session = create_test_session(&port, SessionConfig::default());
    let mut events = session.subscribe_events();
    let mut snapshots = session.subscribe_snapshots();

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event,
        SessionEvent::TransportFailure {
            operation: Operation::Connect,
            ..
        }
    ));
    wait_for_state(&mut snapshots, ConnectionState::Disconnected).await;

    session.connect().unwrap();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;
    assert_eq!(port.count(|c| matches!(c, Call::Connect(_))), 2);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;

    session.disconnect().unwrap();
    wait_for_state(&mut snapshots, ConnectionState::Disconnected).await;
    assert_eq!(port.count(|c| *c == Call::Disconnect), 1);

    // Not valid while disconnected; ignored rather than failing the session
    session.disconnect().unwrap();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(port.count(|c| *c == Call::Disconnect), 1);

    session.close().await;
    assert_eq!(port.count(|c| *c == Call::Disconnect), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_stays_disconnected() {
    let port = MockTransport::new();
    port.script_connect_delay(Duration::from_millis(500));
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let started = Instant::now();

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.snapshot().state, ConnectionState::Connecting);
    session.disconnect().unwrap();
    wait_for_state(&mut snapshots, ConnectionState::Disconnected).await;

    time::sleep(Duration::from_secs(3)).await;
    assert_eq!(session.snapshot().state, ConnectionState::Disconnected);
    assert!(port.reads_since(TARGET, started).is_empty());

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_connected_report_is_released() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;

    session.disconnect().unwrap();
    wait_for_state(&mut snapshots, ConnectionState::Disconnected).await;
    let disconnected = Instant::now();

    port.emit_state(ConnectionState::Connected);
    time::sleep(Duration::from_secs(3)).await;

    assert_eq!(session.snapshot().state, ConnectionState::Disconnected);
    assert_eq!(port.count(|c| *c == Call::Disconnect), 2);
    assert!(port.reads_since(TARGET, disconnected).is_empty());

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_releases_link_and_stops_publishing() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;

    session.close().await;
    assert_eq!(port.calls().last(), Some(&Call::Disconnect));

    // Drain anything published before close; the channel must then be closed
    while snapshots.changed().await.is_ok() {}
    assert_eq!(snapshots.borrow().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_tears_down() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;

    drop(session);
    while snapshots.changed().await.is_ok() {}
    assert!(port.calls().contains(&Call::Disconnect));
}

// ----------------------------------------------------------------------------
// Write and Verify
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_verification_exhausted_after_three_failed_reads() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    port.script_reads([
        Err(gatt_error("GATT 133")),
        Err(gatt_error("GATT 133")),
        Err(gatt_error("GATT 8")),
    ]);
    let written = Instant::now();
    session.write_command(payload()).unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        SessionEvent::VerificationExhausted {
            characteristic: TARGET,
            attempts: 3,
            message: "GATT 8".into(),
        }
    );
    assert_eq!(event.to_string(), "Write failed: GATT 8");

    let reads = port.reads_since(TARGET, written);
    assert_eq!(reads.len(), 3);
    assert_offset(written, reads[0], 200);
    assert_offset(reads[0], reads[1], 5000);
    assert_offset(reads[1], reads[2], 2000);

    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(port.reads_since(TARGET, written).len(), 3);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert!(!session.snapshot().verifying);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_verification_recovers_on_second_read() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    port.script_reads([Err(gatt_error("busy")), Ok(b"50,80,255,0,128".to_vec())]);
    let written = Instant::now();
    session.write_command(payload()).unwrap();

    wait_for(&mut snapshots, |s| s.verifying).await;
    wait_for(&mut snapshots, |s| s.payload == Some(payload()) && !s.verifying).await;

    let reads = port.reads_since(TARGET, written);
    assert_eq!(reads.len(), 2);
    assert_offset(reads[0], reads[1], 5000);

    time::sleep(Duration::from_secs(30)).await;
    assert_eq!(port.reads_since(TARGET, written).len(), 2);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_armed_retry() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    port.script_reads([Err(gatt_error("busy"))]);
    let written = Instant::now();
    session.write_command(payload()).unwrap();

    // First verifying read fails at +200ms, the second is armed for +5200ms
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(port.reads_since(TARGET, written).len(), 1);
    assert!(session.snapshot().verifying);

    port.emit_state(ConnectionState::Disconnected);
    wait_for_state(&mut snapshots, ConnectionState::Disconnected).await;
    assert!(!session.snapshot().verifying);

    time::sleep(Duration::from_secs(30)).await;
    assert_eq!(port.reads_since(TARGET, written).len(), 1);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_surfaces_without_retry() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    port.script_write(Err(gatt_error("GATT 133")));
    let written = Instant::now();
    session.write_command(payload()).unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.to_string(), "Write failed: GATT 133");

    time::sleep(Duration::from_secs(10)).await;
    assert!(port.reads_since(TARGET, written).is_empty());
    assert_eq!(port.count(|c| matches!(c, Call::Write(..))), 1);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_payload_issues_no_transport_call() {
    let port = MockTransport::with_default_value(b"0,0,0,0,0,0,0,0,0,0".to_vec());
    let config = SessionConfig::default().with_profile(Profile::dual_rgb());
    let session = create_test_session(&port, config);
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;

    let mut fields = vec![0; 10];
    fields[0] = 5;
    let result = session.write_command(DevicePayload::new(fields));

    assert!(matches!(result, Err(SessionError::InvalidPayload(_))));
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::InvalidPayload { .. }
    ));

    time::sleep(Duration::from_secs(10)).await;
    assert_eq!(port.count(|c| matches!(c, Call::Write(..))), 0);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_turn_off_writes_zeroed_payload() {
    let port = MockTransport::with_default_value(b"50,80,255,0,128".to_vec());
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    assert_eq!(session.off_payload(), DevicePayload::zeroed(5));
    session.turn_off().unwrap();
    wait_for(&mut snapshots, |s| s.verifying).await;

    assert!(port
        .calls()
        .contains(&Call::Write(TARGET, b"0,0,0,0,0".to_vec())));

    session.close().await;
}

// ----------------------------------------------------------------------------
// Reads, Descriptors and Notifications
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_on_demand_read_failure_is_silent() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;
    let before = session.snapshot();

    port.script_reads([Err(TransportError::NotConnected)]);
    session.read_command().unwrap();
    time::sleep(Duration::from_secs(1)).await;

    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(session.snapshot(), before);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_value_is_shown_raw() {
    let port = MockTransport::with_default_value(b"hello".to_vec());
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();

    wait_for(&mut snapshots, |s| s.raw_value.is_some()).await;
    let snapshot = session.snapshot();
    assert!(snapshot.payload.is_none());
    assert_eq!(snapshot.raw_text().as_deref(), Some("hello"));
    assert!(snapshot.decode_advisory.is_some());
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_other_characteristics_are_cached_raw() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    let battery = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
    port.script_reads([Ok(vec![87])]);
    session.read_characteristic(battery).unwrap();

    wait_for(&mut snapshots, |s| s.characteristic_values.contains_key(&battery)).await;
    assert_eq!(session.snapshot().characteristic_values[&battery], vec![87]);

    session.write_characteristic(battery, vec![1, 2]).unwrap();
    time::sleep(Duration::from_secs(1)).await;
    assert!(port.calls().contains(&Call::Write(battery, vec![1, 2])));
    assert!(!session.snapshot().verifying);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_descriptor_operations() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for_state(&mut snapshots, ConnectionState::Connected).await;

    let cccd = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

    port.script_descriptor_read(Ok(vec![0x01, 0x00]));
    session.read_descriptor(TARGET, cccd).unwrap();
    wait_for(&mut snapshots, |s| s.descriptor_values.contains_key(&(TARGET, cccd))).await;

    session
        .write_descriptor(TARGET, cccd, &DescriptorValue::Hex("02 00".into()))
        .unwrap();
    time::sleep(Duration::from_millis(10)).await;
    assert!(port
        .calls()
        .contains(&Call::WriteDescriptor(TARGET, cccd, vec![0x02, 0x00])));

    let rejected = session.write_descriptor(TARGET, cccd, &DescriptorValue::Hex("020".into()));
    assert!(matches!(rejected, Err(SessionError::InvalidValue(_))));
    assert_eq!(port.count(|c| matches!(c, Call::WriteDescriptor(..))), 1);

    port.script_descriptor_read(Err(TransportError::DescriptorNotFound {
        characteristic: TARGET,
        descriptor: cccd,
    }));
    session.read_descriptor(TARGET, cccd).unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::TransportFailure {
            operation: Operation::ReadDescriptor,
            ..
        }
    ));

    port.script_descriptor_write(Err(gatt_error("write not permitted")));
    session
        .write_descriptor(TARGET, cccd, &DescriptorValue::Text("on".into()))
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::transport_failure(Operation::WriteDescriptor, "write not permitted")
    );

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_notifications_update_payload() {
    let port = MockTransport::new();
    let session = create_test_session(&port, SessionConfig::default());
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    wait_for(&mut snapshots, |s| s.payload.is_some()).await;

    session.enable_notifications(TARGET).unwrap();
    wait_for(&mut snapshots, |s| s.notifying.contains(&TARGET)).await;

    port.push_notification(TARGET, b"1,2,3,4,5");
    wait_for(&mut snapshots, |s| {
        s.payload == Some(DevicePayload::new(vec![1, 2, 3, 4, 5]))
    })
    .await;

    port.script_subscription(Err(gatt_error("not supported")));
    session.enable_notifications(Uuid::nil()).unwrap();
    assert_eq!(
        events.recv().await.unwrap().to_string(),
        "Enable notifications failed: not supported"
    );

    session.close().await;
}
