//! Scripted transport port for session tests
//!
//! Results are popped from per-operation queues; when a queue is empty the
//! call succeeds with a default value. Every call is logged with the paused
//! tokio clock so tests can check retry offsets.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use gattlink_core::transport::{ConnectionStateStream, NotificationStream};
use gattlink_core::{
    CharacteristicUpdate, CommandSession, ConnectionState, DeviceIdentity, SessionConfig,
    SessionSnapshot, TransportError, TransportPort, TransportResult,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

pub const TEST_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// A call the session made on the port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    Disconnect,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    ReadDescriptor(Uuid, Uuid),
    WriteDescriptor(Uuid, Uuid, Vec<u8>),
    EnableNotifications(Uuid),
}

#[derive(Default)]
struct Script {
    calls: Vec<(Instant, Call)>,
    connects: VecDeque<TransportResult<()>>,
    connect_delay: Duration,
    reads: VecDeque<TransportResult<Vec<u8>>>,
    writes: VecDeque<TransportResult<()>>,
    descriptor_reads: VecDeque<TransportResult<Vec<u8>>>,
    descriptor_writes: VecDeque<TransportResult<()>>,
    subscriptions: VecDeque<TransportResult<()>>,
}

pub struct MockTransport {
    script: Mutex<Script>,
    default_value: Vec<u8>,
    states_tx: mpsc::UnboundedSender<ConnectionState>,
    states_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionState>>>,
    notifications_tx: mpsc::UnboundedSender<CharacteristicUpdate>,
    notifications_rx: Mutex<Option<mpsc::UnboundedReceiver<CharacteristicUpdate>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_default_value(b"0,0,0,0,0".to_vec())
    }

    /// Mock whose unscripted reads return `value`
    pub fn with_default_value(value: Vec<u8>) -> Arc<Self> {
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(Script::default()),
            default_value: value,
            states_tx,
            states_rx: Mutex::new(Some(states_rx)),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
        })
    }

    pub fn script_connect(&self, result: TransportResult<()>) {
        self.script.lock().unwrap().connects.push_back(result);
    }

    /// Make every connect take `delay` before the link comes up
    pub fn script_connect_delay(&self, delay: Duration) {
        self.script.lock().unwrap().connect_delay = delay;
    }

    pub fn script_reads(&self, results: impl IntoIterator<Item = TransportResult<Vec<u8>>>) {
        self.script.lock().unwrap().reads.extend(results);
    }

    pub fn script_write(&self, result: TransportResult<()>) {
        self.script.lock().unwrap().writes.push_back(result);
    }

    pub fn script_descriptor_read(&self, result: TransportResult<Vec<u8>>) {
        self.script.lock().unwrap().descriptor_reads.push_back(result);
    }

    pub fn script_descriptor_write(&self, result: TransportResult<()>) {
        self.script.lock().unwrap().descriptor_writes.push_back(result);
    }

    pub fn script_subscription(&self, result: TransportResult<()>) {
        self.script.lock().unwrap().subscriptions.push_back(result);
    }

    /// Report a link state as the radio stack would
    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.states_tx.send(state);
    }

    pub fn push_notification(&self, uuid: Uuid, value: &[u8]) {
        let _ = self.notifications_tx.send(CharacteristicUpdate {
            uuid,
            value: value.to_vec(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Instants of reads of `uuid` made at or after `since`
    pub fn reads_since(&self, uuid: Uuid, since: Instant) -> Vec<Instant> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(at, call)| *at >= since && *call == Call::Read(uuid))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: Call) {
        self.script.lock().unwrap().calls.push((Instant::now(), call));
    }
}

#[async_trait]
impl TransportPort for MockTransport {
    async fn connect(&self, address: &str) -> TransportResult<()> {
        self.record(Call::Connect(address.to_string()));
        let delay = self.script.lock().unwrap().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.script.lock().unwrap().connects.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.emit_state(ConnectionState::Connecting);
            self.emit_state(ConnectionState::Connected);
        }
        result
    }

    async fn disconnect(&self) {
        self.record(Call::Disconnect);
        self.emit_state(ConnectionState::Disconnected);
    }

    async fn read_characteristic(&self, uuid: Uuid) -> TransportResult<Vec<u8>> {
        self.record(Call::Read(uuid));
        self.script
            .lock()
            .unwrap()
            .reads
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_value.clone()))
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> TransportResult<()> {
        self.record(Call::Write(uuid, value.to_vec()));
        self.script.lock().unwrap().writes.pop_front().unwrap_or(Ok(()))
    }

    async fn read_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> TransportResult<Vec<u8>> {
        self.record(Call::ReadDescriptor(characteristic, descriptor));
        self.script
            .lock()
            .unwrap()
            .descriptor_reads
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        self.record(Call::WriteDescriptor(characteristic, descriptor, value.to_vec()));
        self.script
            .lock()
            .unwrap()
            .descriptor_writes
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> TransportResult<()> {
        self.record(Call::EnableNotifications(characteristic));
        self.script
            .lock()
            .unwrap()
            .subscriptions
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn connection_states(&self) -> ConnectionStateStream {
        match self.states_rx.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|state| (state, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    fn notifications(&self) -> NotificationStream {
        match self.notifications_rx.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|update| (update, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

pub fn create_test_session(port: &Arc<MockTransport>, config: SessionConfig) -> CommandSession {
    CommandSession::start(
        port.clone(),
        DeviceIdentity::new("LED strip", TEST_ADDRESS),
        config,
    )
}

pub async fn wait_for(
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) {
    snapshots
        .wait_for(predicate)
        .await
        .expect("session closed while waiting");
}

pub async fn wait_for_state(snapshots: &mut watch::Receiver<SessionSnapshot>, state: ConnectionState) {
    wait_for(snapshots, |s| s.state == state).await;
}

pub fn assert_offset(from: Instant, to: Instant, expected_ms: u64) {
    let actual = to.duration_since(from);
    let expected = Duration::from_millis(expected_ms);
    let slack = Duration::from_millis(5);
    assert!(
        actual + slack >= expected && actual <= expected + slack,
        "expected {:?} between reads, got {:?}",
        expected,
        actual
    );
}

pub fn gatt_error(message: &str) -> TransportError {
    TransportError::Other(message.to_string())
}
