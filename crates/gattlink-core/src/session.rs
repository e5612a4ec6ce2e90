//! Command Session Manager
//!
//! [`CommandSession`] is the handle callers drive a device with. Every intent
//! is forwarded over a channel to a single driver task that owns the
//! [`SessionMachine`], so intents, link state reports, transport results and
//! retry timers are applied one at a time in arrival order.
//!
//! Observers read state through a `watch` channel of [`SessionSnapshot`]s and
//! receive transient failures from a `broadcast` channel of [`SessionEvent`]s.
//! Events sent while nobody is subscribed are dropped.

use std::future::Future;
use std::sync::Arc;

use futures::{future, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::DescriptorValue;
use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::machine::{Completion, Effect, Intent, SessionMachine};
use crate::profile::{DevicePayload, Profile};
use crate::snapshot::{DeviceIdentity, SessionEvent, SessionSnapshot};
use crate::transport::TransportPort;

// ----------------------------------------------------------------------------
// Command Session Handle
// ----------------------------------------------------------------------------

/// Handle to one device session
///
/// Dropping the handle tears the session down in the background; use
/// [`close`](Self::close) to wait until the link has been released.
pub struct CommandSession {
    intents: mpsc::UnboundedSender<Intent>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    profile: Profile,
    characteristic: Uuid,
    task: JoinHandle<()>,
}

impl CommandSession {
    /// Start a session and issue the initial connect
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        port: Arc<dyn TransportPort>,
        identity: DeviceIdentity,
        config: SessionConfig,
    ) -> Self {
        let machine = SessionMachine::new(identity, config.clone());
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(machine.snapshot());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        info!("Starting session for {}", machine.snapshot().identity);

        let driver = SessionDriver {
            port,
            machine,
            intents: intents_rx,
            completions_tx,
            completions_rx,
            snapshots: snapshots_tx,
            events: events_tx.clone(),
            in_flight: JoinSet::new(),
            connect_call: None,
        };
        let task = tokio::spawn(driver.run());

        Self {
            intents: intents_tx,
            snapshots: snapshots_rx,
            events: events_tx,
            profile: config.profile,
            characteristic: config.characteristic_uuid,
            task,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Request a new connection after a disconnect
    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(Intent::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Intent::Disconnect)
    }

    /// Best-effort read; transport failures are not reported
    pub fn read_characteristic(&self, uuid: Uuid) -> Result<(), SessionError> {
        self.send(Intent::ReadCharacteristic(uuid))
    }

    /// Best-effort read of the command characteristic
    pub fn read_command(&self) -> Result<(), SessionError> {
        self.read_characteristic(self.characteristic)
    }

    /// Write a command payload and verify it by reading it back
    ///
    /// Payloads that do not fit the active profile are rejected here and
    /// never reach the transport.
    pub fn write_command(&self, payload: DevicePayload) -> Result<(), SessionError> {
        if let Err(e) = self.profile.validate(&payload) {
            warn!("Rejecting payload {}: {}", payload, e);
            let _ = self.events.send(SessionEvent::InvalidPayload {
                message: e.to_string(),
            });
            return Err(SessionError::InvalidPayload(e));
        }
        self.send(Intent::WriteCommand(payload))
    }

    /// Write the all-zero payload
    pub fn turn_off(&self) -> Result<(), SessionError> {
        self.write_command(self.off_payload())
    }

    /// Payload [`turn_off`](Self::turn_off) writes
    pub fn off_payload(&self) -> DevicePayload {
        DevicePayload::zeroed(self.profile.arity())
    }

    /// Single-shot raw write, no verification
    pub fn write_characteristic(&self, uuid: Uuid, value: Vec<u8>) -> Result<(), SessionError> {
        self.send(Intent::WriteCharacteristic { uuid, value })
    }

    pub fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<(), SessionError> {
        self.send(Intent::ReadDescriptor {
            characteristic,
            descriptor,
        })
    }

    pub fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &DescriptorValue,
    ) -> Result<(), SessionError> {
        let value = value.to_bytes().map_err(SessionError::InvalidValue)?;
        self.send(Intent::WriteDescriptor {
            characteristic,
            descriptor,
            value,
        })
    }

    pub fn enable_notifications(&self, characteristic: Uuid) -> Result<(), SessionError> {
        self.send(Intent::EnableNotifications(characteristic))
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified whenever a new snapshot is published
    pub fn subscribe_snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Receiver for events emitted from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Tear the session down and wait for the transport to be released
    pub async fn close(self) {
        let CommandSession { intents, task, .. } = self;
        drop(intents);
        if let Err(e) = task.await {
            warn!("Session task ended abnormally: {}", e);
        }
    }

    fn send(&self, intent: Intent) -> Result<(), SessionError> {
        self.intents.send(intent).map_err(|_| SessionError::Closed)
    }
}

// ----------------------------------------------------------------------------
// Session Driver
// ----------------------------------------------------------------------------

/// Task that owns the machine and carries out its effects
struct SessionDriver {
    port: Arc<dyn TransportPort>,
    machine: SessionMachine,
    intents: mpsc::UnboundedReceiver<Intent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshots: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    in_flight: JoinSet<()>,
    /// Outstanding connect call, aborted when the caller disconnects
    connect_call: Option<AbortHandle>,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut link_states = self.port.connection_states().fuse();
        let mut notifications = self.port.notifications().fuse();

        self.apply_intent(Intent::Connect);

        loop {
            let deadline = self.machine.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                intent = self.intents.recv() => {
                    match intent {
                        Some(intent) => self.apply_intent(intent),
                        None => {
                            debug!("Session handle dropped");
                            break;
                        }
                    }
                }

                Some(state) = link_states.next() => {
                    let effects = self.machine.handle_link_state(state, Instant::now());
                    self.execute(effects);
                }

                Some(update) = notifications.next() => {
                    debug!("Notification from {}: {} bytes", update.uuid, update.value.len());
                    let effects = self.machine.handle_notification(update);
                    self.execute(effects);
                }

                Some(completion) = self.completions_rx.recv() => {
                    let effects = self.machine.handle_completion(completion, Instant::now());
                    self.execute(effects);
                }

                _ = timer => {
                    let effects = self.machine.poll_timers(Instant::now());
                    self.execute(effects);
                }

                Some(_) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {}
            }
        }

        self.teardown().await;
    }

    fn apply_intent(&mut self, intent: Intent) {
        let name = intent.name();
        match self.machine.handle_intent(intent) {
            Ok(effects) => self.execute(effects),
            Err(e) => warn!("Ignoring {} intent: {}", name, e),
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish => {
                    self.snapshots.send_replace(self.machine.snapshot());
                }
                Effect::Emit(event) => {
                    info!("Session event: {}", event);
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
                Effect::Connect { address } => {
                    debug!("Connecting to {}", address);
                    let handle = self.spawn_call(|port| async move {
                        Completion::Connect(port.connect(&address).await)
                    });
                    self.connect_call = Some(handle);
                }
                Effect::Disconnect => {
                    debug!("Disconnecting");
                    if let Some(connect) = self.connect_call.take() {
                        connect.abort();
                    }
                    let port = Arc::clone(&self.port);
                    self.in_flight.spawn(async move { port.disconnect().await });
                }
                Effect::ReadCharacteristic { uuid, purpose } => {
                    debug!("Reading {} ({:?})", uuid, purpose);
                    self.spawn_call(move |port| async move {
                        let result = port.read_characteristic(uuid).await;
                        Completion::ReadCharacteristic {
                            uuid,
                            purpose,
                            result,
                        }
                    });
                }
                Effect::WriteCharacteristic {
                    uuid,
                    value,
                    purpose,
                } => {
                    debug!("Writing {} bytes to {}", value.len(), uuid);
                    self.spawn_call(move |port| async move {
                        let result = port.write_characteristic(uuid, &value).await;
                        Completion::WriteCharacteristic {
                            uuid,
                            purpose,
                            result,
                        }
                    });
                }
                Effect::ReadDescriptor {
                    characteristic,
                    descriptor,
                } => {
                    self.spawn_call(move |port| async move {
                        let result = port.read_descriptor(characteristic, descriptor).await;
                        Completion::ReadDescriptor {
                            characteristic,
                            descriptor,
                            result,
                        }
                    });
                }
                Effect::WriteDescriptor {
                    characteristic,
                    descriptor,
                    value,
                } => {
                    self.spawn_call(move |port| async move {
                        let result = port
                            .write_descriptor(characteristic, descriptor, &value)
                            .await;
                        Completion::WriteDescriptor {
                            characteristic,
                            descriptor,
                            result,
                        }
                    });
                }
                Effect::EnableNotifications { characteristic } => {
                    self.spawn_call(move |port| async move {
                        let result = port.enable_notifications(characteristic).await;
                        Completion::EnableNotifications {
                            characteristic,
                            result,
                        }
                    });
                }
            }
        }
    }

    /// Run a transport call off the driver loop and feed its result back in
    fn spawn_call<F, Fut>(&mut self, call: F) -> AbortHandle
    where
        F: FnOnce(Arc<dyn TransportPort>) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let call = call(Arc::clone(&self.port));
        let completions = self.completions_tx.clone();
        self.in_flight.spawn(async move {
            let _ = completions.send(call.await);
        })
    }

    async fn teardown(mut self) {
        self.in_flight.abort_all();
        for effect in self.machine.teardown() {
            if effect == Effect::Disconnect {
                info!("Releasing link on teardown");
                self.port.disconnect().await;
            }
        }
        info!("Session closed");
    }
}
