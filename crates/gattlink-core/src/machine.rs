//! Session State Machine
//!
//! Owns the connection state, the last command value and the retry state of
//! an outstanding write. The machine performs no I/O: every input returns the
//! [`Effect`]s the session driver must carry out, and results of those effects
//! come back later as [`Completion`]s. Time only enters through the `now`
//! arguments and [`SessionMachine::next_deadline`], which is what lets tests
//! drive the retry schedule on a simulated clock.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::SessionConfig;
use crate::errors::{TransitionError, TransportResult};
use crate::profile::DevicePayload;
use crate::snapshot::{DeviceIdentity, Operation, SessionEvent, SessionSnapshot};
use crate::transport::{CharacteristicUpdate, ConnectionState};

/// Delays before each verifying read: after the write, then after each failed read
pub const VERIFY_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(5000),
    Duration::from_millis(2000),
];

// ----------------------------------------------------------------------------
// Inputs and Effects
// ----------------------------------------------------------------------------

/// Operations requested by the session's caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Connect,
    Disconnect,
    ReadCharacteristic(Uuid),
    WriteCommand(DevicePayload),
    WriteCharacteristic {
        uuid: Uuid,
        value: Vec<u8>,
    },
    ReadDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    EnableNotifications(Uuid),
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Connect => "Connect",
            Intent::Disconnect => "Disconnect",
            Intent::ReadCharacteristic(_) => "ReadCharacteristic",
            Intent::WriteCommand(_) => "WriteCommand",
            Intent::WriteCharacteristic { .. } => "WriteCharacteristic",
            Intent::ReadDescriptor { .. } => "ReadDescriptor",
            Intent::WriteDescriptor { .. } => "WriteDescriptor",
            Intent::EnableNotifications(_) => "EnableNotifications",
        }
    }
}

/// Why a characteristic read was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPurpose {
    /// Requested by the caller; failures are swallowed
    OnDemand,
    /// Initial read after the link settles
    Settle,
    /// Confirms that a write was applied
    Verify { write_id: u64, attempt: u8 },
}

/// Why a characteristic write was issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePurpose {
    /// Command payload, verified by reading it back
    Command { write_id: u64, payload: DevicePayload },
    /// Caller supplied bytes, single-shot
    Raw,
}

/// Work the driver performs on behalf of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect {
        address: String,
    },
    Disconnect,
    ReadCharacteristic {
        uuid: Uuid,
        purpose: ReadPurpose,
    },
    WriteCharacteristic {
        uuid: Uuid,
        value: Vec<u8>,
        purpose: WritePurpose,
    },
    ReadDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    EnableNotifications {
        characteristic: Uuid,
    },
    /// Deliver an event to current listeners
    Emit(SessionEvent),
    /// Republish the snapshot
    Publish,
}

/// Result of a transport call started by an [`Effect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Connect(TransportResult<()>),
    ReadCharacteristic {
        uuid: Uuid,
        purpose: ReadPurpose,
        result: TransportResult<Vec<u8>>,
    },
    WriteCharacteristic {
        uuid: Uuid,
        purpose: WritePurpose,
        result: TransportResult<()>,
    },
    ReadDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        result: TransportResult<Vec<u8>>,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        result: TransportResult<()>,
    },
    EnableNotifications {
        characteristic: Uuid,
        result: TransportResult<()>,
    },
}

// ----------------------------------------------------------------------------
// Pending Write
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyStage {
    /// Next verifying read is due at this instant
    Scheduled(Instant),
    /// A verifying read is in flight
    Reading,
}

/// A successful write waiting for a verifying read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub id: u64,
    pub characteristic: Uuid,
    pub payload: DevicePayload,
    /// Verifying reads issued so far
    pub attempts: u8,
    stage: VerifyStage,
}

impl PendingWrite {
    fn due_at(&self) -> Option<Instant> {
        match self.stage {
            VerifyStage::Scheduled(at) => Some(at),
            VerifyStage::Reading => None,
        }
    }
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Connection and command state of one session
#[derive(Debug)]
pub struct SessionMachine {
    config: SessionConfig,
    snapshot: SessionSnapshot,
    pending: Option<PendingWrite>,
    settle_read_at: Option<Instant>,
    next_write_id: u64,
}

impl SessionMachine {
    pub fn new(identity: DeviceIdentity, config: SessionConfig) -> Self {
        Self {
            config,
            snapshot: SessionSnapshot::new(identity),
            pending: None,
            settle_read_at: None,
            next_write_id: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pending_write(&self) -> Option<&PendingWrite> {
        self.pending.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.snapshot.clone();
        snapshot.verifying = self.pending.is_some();
        snapshot
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let verify_at = self.pending.as_ref().and_then(PendingWrite::due_at);
        match (self.settle_read_at, verify_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply a caller intent
    pub fn handle_intent(&mut self, intent: Intent) -> Result<Vec<Effect>, TransitionError> {
        let target = self.config.characteristic_uuid;

        let effects = match intent {
            Intent::Connect => {
                if self.state() != ConnectionState::Disconnected {
                    return Err(self.invalid(&Intent::Connect));
                }
                self.set_state(ConnectionState::Connecting);
                vec![
                    Effect::Connect {
                        address: self.snapshot.identity.address.clone(),
                    },
                    Effect::Publish,
                ]
            }

            Intent::Disconnect => {
                if !matches!(
                    self.state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    return Err(self.invalid(&Intent::Disconnect));
                }
                self.set_state(ConnectionState::Disconnecting);
                self.cancel_timers();
                vec![Effect::Disconnect, Effect::Publish]
            }

            Intent::ReadCharacteristic(uuid) => vec![Effect::ReadCharacteristic {
                uuid,
                purpose: ReadPurpose::OnDemand,
            }],

            Intent::WriteCommand(payload) => {
                if let Err(e) = self.config.profile.validate(&payload) {
                    warn!("Rejecting payload {}: {}", payload, e);
                    return Ok(vec![Effect::Emit(SessionEvent::InvalidPayload {
                        message: e.to_string(),
                    })]);
                }

                let write_id = self.next_write_id;
                self.next_write_id += 1;
                debug!("Writing command {} as write #{}", payload, write_id);

                vec![Effect::WriteCharacteristic {
                    uuid: target,
                    value: codec::encode(&payload),
                    purpose: WritePurpose::Command { write_id, payload },
                }]
            }

            Intent::WriteCharacteristic { uuid, value } => vec![Effect::WriteCharacteristic {
                uuid,
                value,
                purpose: WritePurpose::Raw,
            }],

            Intent::ReadDescriptor {
                characteristic,
                descriptor,
            } => vec![Effect::ReadDescriptor {
                characteristic,
                descriptor,
            }],

            Intent::WriteDescriptor {
                characteristic,
                descriptor,
                value,
            } => vec![Effect::WriteDescriptor {
                characteristic,
                descriptor,
                value,
            }],

            Intent::EnableNotifications(characteristic) => {
                vec![Effect::EnableNotifications { characteristic }]
            }
        };

        Ok(effects)
    }

    /// Apply a link state report from the transport
    ///
    /// Reports equal to the current state are dropped, so a stack that repeats
    /// `Connected` does not trigger another settle read. `Connected` is only
    /// accepted while connecting; a link that comes up after the caller gave it
    /// up is released instead.
    pub fn handle_link_state(&mut self, reported: ConnectionState, now: Instant) -> Vec<Effect> {
        let current = self.state();
        if reported == current {
            debug!("Ignoring repeated {} report", reported);
            return Vec::new();
        }

        match (current, reported) {
            (
                ConnectionState::Disconnecting | ConnectionState::Disconnected,
                ConnectionState::Connected,
            ) => {
                warn!("Link reported Connected while {}; releasing it", current);
                return vec![Effect::Disconnect];
            }
            (ConnectionState::Disconnecting, ConnectionState::Connecting) => {
                debug!("Ignoring Connecting report while disconnecting");
                return Vec::new();
            }
            _ => {}
        }

        info!("Connection state {} -> {}", self.state(), reported);
        self.set_state(reported);

        match reported {
            ConnectionState::Connected => {
                self.settle_read_at = Some(now + self.config.settle_delay);
            }
            ConnectionState::Disconnected => {
                self.cancel_timers();
                self.snapshot.notifying.clear();
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                self.cancel_timers();
            }
        }

        vec![Effect::Publish]
    }

    /// Apply the result of a transport call
    pub fn handle_completion(&mut self, completion: Completion, now: Instant) -> Vec<Effect> {
        match completion {
            Completion::Connect(Ok(())) => {
                debug!("Connect request accepted");
                Vec::new()
            }
            Completion::Connect(Err(e)) => {
                warn!("Connect failed: {}", e);
                let mut effects = Vec::new();
                if self.state() == ConnectionState::Connecting {
                    effects = self.handle_link_state(ConnectionState::Disconnected, now);
                }
                effects.insert(
                    0,
                    Effect::Emit(SessionEvent::transport_failure(
                        Operation::Connect,
                        e.to_string(),
                    )),
                );
                effects
            }

            Completion::ReadCharacteristic {
                uuid,
                purpose,
                result,
            } => self.handle_read(uuid, purpose, result, now),

            Completion::WriteCharacteristic {
                uuid,
                purpose,
                result,
            } => self.handle_write(uuid, purpose, result, now),

            Completion::ReadDescriptor {
                characteristic,
                descriptor,
                result,
            } => match result {
                Ok(value) => {
                    self.snapshot
                        .descriptor_values
                        .insert((characteristic, descriptor), value);
                    vec![Effect::Publish]
                }
                Err(e) => vec![Effect::Emit(SessionEvent::transport_failure(
                    Operation::ReadDescriptor,
                    e.to_string(),
                ))],
            },

            Completion::WriteDescriptor { result, .. } => match result {
                Ok(()) => Vec::new(),
                Err(e) => vec![Effect::Emit(SessionEvent::transport_failure(
                    Operation::WriteDescriptor,
                    e.to_string(),
                ))],
            },

            Completion::EnableNotifications {
                characteristic,
                result,
            } => match result {
                Ok(()) => {
                    self.snapshot.notifying.insert(characteristic);
                    vec![Effect::Publish]
                }
                Err(e) => vec![Effect::Emit(SessionEvent::transport_failure(
                    Operation::EnableNotifications,
                    e.to_string(),
                ))],
            },
        }
    }

    /// Apply a value pushed by the peripheral
    pub fn handle_notification(&mut self, update: CharacteristicUpdate) -> Vec<Effect> {
        self.store_value(update.uuid, update.value);
        vec![Effect::Publish]
    }

    /// Issue the reads whose deadlines have passed
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.settle_read_at.is_some_and(|at| at <= now) {
            self.settle_read_at = None;
            effects.push(Effect::ReadCharacteristic {
                uuid: self.config.characteristic_uuid,
                purpose: ReadPurpose::Settle,
            });
        }

        if let Some(pending) = self.pending.as_mut() {
            if pending.due_at().is_some_and(|at| at <= now) {
                pending.attempts += 1;
                pending.stage = VerifyStage::Reading;
                debug!(
                    "Verifying write #{} (attempt {}/{})",
                    pending.id,
                    pending.attempts,
                    VERIFY_SCHEDULE.len()
                );
                effects.push(Effect::ReadCharacteristic {
                    uuid: pending.characteristic,
                    purpose: ReadPurpose::Verify {
                        write_id: pending.id,
                        attempt: pending.attempts,
                    },
                });
            }
        }

        effects
    }

    /// Drop all scheduled work; returns the disconnect still owed to the transport
    pub fn teardown(&mut self) -> Vec<Effect> {
        self.cancel_timers();
        if self.state() == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.set_state(ConnectionState::Disconnected);
        vec![Effect::Disconnect]
    }

    fn handle_read(
        &mut self,
        uuid: Uuid,
        purpose: ReadPurpose,
        result: TransportResult<Vec<u8>>,
        now: Instant,
    ) -> Vec<Effect> {
        match purpose {
            ReadPurpose::OnDemand => match result {
                Ok(value) => {
                    self.store_value(uuid, value);
                    vec![Effect::Publish]
                }
                Err(e) => {
                    debug!("On-demand read of {} failed: {}", uuid, e);
                    Vec::new()
                }
            },

            ReadPurpose::Settle => match result {
                Ok(value) => {
                    self.store_value(uuid, value);
                    vec![Effect::Publish]
                }
                Err(e) => vec![Effect::Emit(SessionEvent::transport_failure(
                    Operation::AutoRead,
                    e.to_string(),
                ))],
            },

            ReadPurpose::Verify { write_id, attempt } => {
                let current = self.pending.as_ref().is_some_and(|p| {
                    p.id == write_id && p.attempts == attempt && p.stage == VerifyStage::Reading
                });
                if !current {
                    debug!(
                        "Dropping stale verifying read for write #{} (attempt {})",
                        write_id, attempt
                    );
                    return Vec::new();
                }

                match result {
                    Ok(value) => {
                        info!("Write #{} verified on attempt {}", write_id, attempt);
                        self.pending = None;
                        self.store_value(uuid, value);
                        vec![Effect::Publish]
                    }
                    Err(e) if usize::from(attempt) >= VERIFY_SCHEDULE.len() => {
                        warn!(
                            "Write #{} unverified after {} reads: {}",
                            write_id, attempt, e
                        );
                        self.pending = None;
                        vec![
                            Effect::Emit(SessionEvent::VerificationExhausted {
                                characteristic: uuid,
                                attempts: attempt,
                                message: e.to_string(),
                            }),
                            Effect::Publish,
                        ]
                    }
                    Err(e) => {
                        let delay = VERIFY_SCHEDULE[usize::from(attempt)];
                        debug!(
                            "Verifying read {} for write #{} failed ({}), retrying in {:?}",
                            attempt, write_id, e, delay
                        );
                        if let Some(pending) = self.pending.as_mut() {
                            pending.stage = VerifyStage::Scheduled(now + delay);
                        }
                        Vec::new()
                    }
                }
            }
        }
    }

    fn handle_write(
        &mut self,
        uuid: Uuid,
        purpose: WritePurpose,
        result: TransportResult<()>,
        now: Instant,
    ) -> Vec<Effect> {
        if let Err(e) = result {
            warn!("Write to {} failed: {}", uuid, e);
            return vec![Effect::Emit(SessionEvent::transport_failure(
                Operation::Write,
                e.to_string(),
            ))];
        }

        let (write_id, payload) = match purpose {
            WritePurpose::Raw => return Vec::new(),
            WritePurpose::Command { write_id, payload } => (write_id, payload),
        };

        if !self.state().is_connected() {
            debug!(
                "Write #{} completed while {}, not verifying",
                write_id,
                self.state()
            );
            return Vec::new();
        }

        if let Some(previous) = self.pending.as_ref() {
            debug!("Write #{} supersedes write #{}", write_id, previous.id);
        }

        self.pending = Some(PendingWrite {
            id: write_id,
            characteristic: uuid,
            payload,
            attempts: 0,
            stage: VerifyStage::Scheduled(now + VERIFY_SCHEDULE[0]),
        });

        vec![Effect::Publish]
    }

    fn store_value(&mut self, uuid: Uuid, value: Vec<u8>) {
        if uuid != self.config.characteristic_uuid {
            self.snapshot.characteristic_values.insert(uuid, value);
            return;
        }

        match codec::decode(&value, &self.config.profile) {
            Ok(payload) => {
                self.snapshot.payload = Some(payload);
                self.snapshot.decode_advisory = None;
            }
            Err(e) => {
                debug!("Command value is not a {} payload: {}", self.config.profile.name, e);
                self.snapshot.payload = None;
                self.snapshot.decode_advisory = Some(e);
            }
        }
        self.snapshot.raw_value = Some(value);
    }

    fn cancel_timers(&mut self) {
        self.settle_read_at = None;
        if let Some(pending) = self.pending.take() {
            debug!("Abandoning verification of write #{}", pending.id);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.snapshot.state = state;
    }

    fn invalid(&self, intent: &Intent) -> TransitionError {
        TransitionError::InvalidTransition {
            from_state: self.state().state_name(),
            intent: intent.name(),
        }
    }
}
