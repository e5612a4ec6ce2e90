//! Command handlers for the gattlink CLI

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattlink_ble::BtleplugTransport;
use gattlink_core::{
    CommandSession, ConnectionState, DescriptorValue, DevicePayload, Operation, Profile,
    SessionError, SessionEvent, SessionSnapshot, VERIFY_SCHEDULE,
};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Time to wait for a read or descriptor result
const RESULT_WAIT: Duration = Duration::from_secs(5);

/// Grace period for a failure event after a single-shot write
const FAILURE_GRACE: Duration = Duration::from_secs(2);

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Profiles => {
                for profile in Profile::builtin() {
                    println!("{}", describe_profile(&profile));
                }
                Ok(())
            }
            Commands::ShowConfig => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
            command => {
                let session = open_session(&config).await?;
                let result = Self::run_session_command(command, &session, &config).await;
                session.close().await;
                result
            }
        }
    }

    async fn run_session_command(
        command: Commands,
        session: &CommandSession,
        config: &AppConfig,
    ) -> Result<()> {
        wait_connected(session, connect_budget(config)).await?;

        match command {
            Commands::Monitor => monitor(session).await,
            Commands::Read { characteristic } => {
                let uuid = match characteristic {
                    Some(text) => parse_uuid(&text)?,
                    None => config.session.characteristic_uuid,
                };
                Self::handle_read(session, config, uuid).await
            }
            Commands::Write { payload } => {
                let payload = parse_payload(&payload)?;
                let request = payload.clone();
                Self::handle_write(session, payload, move |s| s.write_command(request)).await
            }
            Commands::Off => {
                let payload = session.off_payload();
                Self::handle_write(session, payload, CommandSession::turn_off).await
            }
            Commands::ReadDescriptor {
                characteristic,
                descriptor,
            } => {
                let key = (parse_uuid(&characteristic)?, parse_uuid(&descriptor)?);
                Self::handle_read_descriptor(session, key).await
            }
            Commands::WriteDescriptor {
                characteristic,
                descriptor,
                text,
                hex,
            } => {
                let value = match (text, hex) {
                    (Some(text), _) => DescriptorValue::Text(text),
                    (None, Some(hex)) => DescriptorValue::Hex(hex),
                    (None, None) => {
                        return Err(CliError::InvalidInput("Pass --text or --hex".into()))
                    }
                };
                Self::handle_write_descriptor(
                    session,
                    parse_uuid(&characteristic)?,
                    parse_uuid(&descriptor)?,
                    value,
                )
                .await
            }
            Commands::Notify { characteristic } => {
                let uuid = match characteristic {
                    Some(text) => parse_uuid(&text)?,
                    None => config.session.characteristic_uuid,
                };
                session.enable_notifications(uuid)?;
                monitor(session).await
            }
            Commands::Profiles | Commands::ShowConfig => Ok(()),
        }
    }

    /// Handle the read command
    async fn handle_read(session: &CommandSession, config: &AppConfig, uuid: Uuid) -> Result<()> {
        let target = uuid == config.session.characteristic_uuid;
        let mut snapshots = session.subscribe_snapshots();
        snapshots.borrow_and_update();

        session.read_characteristic(uuid)?;

        let read = timeout(
            RESULT_WAIT,
            next_value(&mut snapshots, |snapshot| {
                if target {
                    snapshot.raw_value.is_some()
                } else {
                    snapshot.characteristic_values.contains_key(&uuid)
                }
            }),
        )
        .await;

        match read {
            Ok(Some(snapshot)) if target => {
                println!("{}", describe_command_value(&snapshot));
                Ok(())
            }
            Ok(Some(snapshot)) => {
                let value = snapshot.characteristic_values.get(&uuid).cloned().unwrap_or_default();
                println!("{}: {}", uuid, describe_bytes(&value));
                Ok(())
            }
            _ => Err(CliError::Timeout(format!("a value from {}", uuid))),
        }
    }

    /// Handle the write and off commands
    async fn handle_write(
        session: &CommandSession,
        payload: DevicePayload,
        send: impl FnOnce(&CommandSession) -> std::result::Result<(), SessionError>,
    ) -> Result<()> {
        let mut snapshots = session.subscribe_snapshots();
        let mut events = session.subscribe_events();
        snapshots.borrow_and_update();

        send(session)?;
        info!("Wrote {}, verifying", payload);

        let verify_budget = VERIFY_SCHEDULE.iter().sum::<Duration>() + RESULT_WAIT;
        let mut seen_verifying = false;

        let outcome = timeout(verify_budget, async {
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            return Err(CliError::Operation("Session closed".into()));
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        seen_verifying |= snapshot.verifying;
                        let settled = !snapshot.verifying
                            && (seen_verifying || snapshot.payload.as_ref() == Some(&payload));
                        if settled {
                            return Ok(snapshot);
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event @ SessionEvent::VerificationExhausted { .. })
                            | Ok(event @ SessionEvent::TransportFailure { operation: Operation::Write, .. })
                            | Ok(event @ SessionEvent::InvalidPayload { .. }) => {
                                return Err(CliError::Operation(event.to_string()));
                            }
                            Ok(other) => debug!("Ignoring event: {}", other),
                            Err(RecvError::Lagged(n)) => warn!("Missed {} session events", n),
                            Err(RecvError::Closed) => {
                                return Err(CliError::Operation("Session closed".into()));
                            }
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| CliError::Timeout("write verification".into()))??;

        println!("Verified: {}", describe_command_value(&outcome));
        Ok(())
    }

    /// Handle the read-descriptor command
    async fn handle_read_descriptor(session: &CommandSession, key: (Uuid, Uuid)) -> Result<()> {
        let mut snapshots = session.subscribe_snapshots();
        let mut events = session.subscribe_events();
        snapshots.borrow_and_update();

        session.read_descriptor(key.0, key.1)?;

        let value = timeout(RESULT_WAIT, async {
            loop {
                tokio::select! {
                    snapshot = next_value(&mut snapshots, |s| s.descriptor_values.contains_key(&key)) => {
                        return snapshot
                            .and_then(|s| s.descriptor_values.get(&key).cloned())
                            .ok_or_else(|| CliError::Operation("Session closed".into()));
                    }
                    event = events.recv() => {
                        if let Ok(event @ SessionEvent::TransportFailure { operation: Operation::ReadDescriptor, .. }) = event {
                            return Err(CliError::Operation(event.to_string()));
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| CliError::Timeout("descriptor value".into()))??;

        println!("{}/{}: {}", key.0, key.1, describe_bytes(&value));
        Ok(())
    }

    /// Handle the write-descriptor command
    async fn handle_write_descriptor(
        session: &CommandSession,
        characteristic: Uuid,
        descriptor: Uuid,
        value: DescriptorValue,
    ) -> Result<()> {
        let mut events = session.subscribe_events();
        session.write_descriptor(characteristic, descriptor, &value)?;

        // Success is silent; only a failure event tells us anything
        let failure = timeout(FAILURE_GRACE, async {
            loop {
                match events.recv().await {
                    Ok(event @ SessionEvent::TransportFailure { operation: Operation::WriteDescriptor, .. }) => {
                        return Some(event);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match failure {
            Ok(Some(event)) => Err(CliError::Operation(event.to_string())),
            _ => {
                println!("Descriptor {}/{} written", characteristic, descriptor);
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Session Helpers
// ----------------------------------------------------------------------------

async fn open_session(config: &AppConfig) -> Result<CommandSession> {
    let identity = config.identity()?;
    let transport = BtleplugTransport::new(config.ble.clone()).await?;
    Ok(CommandSession::start(
        Arc::new(transport),
        identity,
        config.session.clone(),
    ))
}

fn connect_budget(config: &AppConfig) -> Duration {
    config.ble.scan_timeout + config.ble.connection_timeout + Duration::from_secs(1)
}

/// Wait for the initial connect to succeed or fail
async fn wait_connected(session: &CommandSession, budget: Duration) -> Result<()> {
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    let mut attempted = false;

    let connected = async {
        loop {
            let state = snapshots.borrow_and_update().state;
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => attempted = true,
                ConnectionState::Disconnected if attempted => {
                    return Err(CliError::Connection("Link dropped while connecting".into()))
                }
                _ => {}
            }

            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return Err(CliError::Connection("Session closed".into()));
                    }
                }
                event = events.recv() => {
                    if let Ok(SessionEvent::TransportFailure { operation: Operation::Connect, message }) = event {
                        return Err(CliError::Connection(message));
                    }
                }
            }
        }
    };

    timeout(budget, connected)
        .await
        .map_err(|_| CliError::Timeout("connection".into()))?
}

/// Wait for a snapshot published after the last one seen that has the value
///
/// The snapshot current on entry is skipped, so a value left over from an
/// earlier read is never mistaken for the answer to a new request.
async fn next_value(
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    has_value: impl Fn(&SessionSnapshot) -> bool,
) -> Option<SessionSnapshot> {
    loop {
        snapshots.changed().await.ok()?;
        let snapshot = snapshots.borrow_and_update();
        if has_value(&snapshot) {
            return Some(snapshot.clone());
        }
    }
}

/// Print snapshots and events until Ctrl+C
async fn monitor(session: &CommandSession) -> Result<()> {
    let mut snapshots = session.subscribe_snapshots();
    let mut events = session.subscribe_events();
    info!("Monitoring {}... Press Ctrl+C to stop", session.snapshot().identity);

    println!("{}", describe_snapshot(&snapshots.borrow_and_update()));
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                println!("{}", describe_snapshot(&snapshots.borrow_and_update()));
            }
            event = events.recv() => match event {
                Ok(event) => println!("! {}", event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} session events", n),
                Err(RecvError::Closed) => return Ok(()),
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Stopping monitor");
                return Ok(());
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Parsing and Rendering
// ----------------------------------------------------------------------------

fn parse_uuid(text: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(text.trim())?)
}

/// Parse `50,80,255,0,128` into fields; ranges are checked by the session
pub fn parse_payload(text: &str) -> Result<DevicePayload> {
    text.split(',')
        .map(|part| {
            let part = part.trim();
            part.bytes()
                .all(|b| b.is_ascii_digit())
                .then(|| part.parse::<u32>().ok())
                .flatten()
                .ok_or_else(|| CliError::InvalidInput(format!("{:?} is not a field value", part)))
        })
        .collect::<Result<Vec<u32>>>()
        .map(DevicePayload::new)
}

pub fn describe_bytes(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().all(|c| !c.is_control()) && !bytes.is_empty() {
        format!("{:?} (0x{})", text, hex::encode(bytes))
    } else {
        format!("0x{}", hex::encode(bytes))
    }
}

pub fn describe_command_value(snapshot: &SessionSnapshot) -> String {
    match (&snapshot.payload, &snapshot.raw_value, &snapshot.decode_advisory) {
        (Some(payload), _, _) => payload.to_string(),
        (None, Some(raw), Some(advisory)) => format!("raw {} ({})", describe_bytes(raw), advisory),
        (None, Some(raw), None) => format!("raw {}", describe_bytes(raw)),
        (None, None, _) => "no value".to_string(),
    }
}

pub fn describe_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut line = format!(
        "[{}] {} value={}",
        snapshot.state,
        snapshot.identity,
        describe_command_value(snapshot)
    );
    if snapshot.verifying {
        line.push_str(" (verifying)");
    }
    if !snapshot.notifying.is_empty() {
        line.push_str(&format!(" notifying={}", snapshot.notifying.len()));
    }
    line
}

pub fn describe_profile(profile: &Profile) -> String {
    let fields: Vec<String> = profile
        .fields
        .iter()
        .map(|f| format!("{}[{}..={}]", f.name, f.min, f.max))
        .collect();
    format!("{}: {}", profile.name, fields.join(", "))
}
