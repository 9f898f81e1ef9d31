use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ControlError;
use crate::protocol::{format_timestamp, ControllerEvent, ControllerMessage};

/// How a caller names the session it wants to reach: either the opaque
/// connection handle itself, or the device identifier the agent registered
/// with. Keeping this explicit removes the "string might be either" ambiguity
/// at the type level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Handle(String),
    Device(String),
}

/// Live-connection record for one agent. Created as an unregistered
/// placeholder on connect and promoted once a registration message with a
/// non-empty identifier arrives.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub conn_id: String,
    pub device_id: Option<String>,
    pub display_name: String,
    pub platform: String,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

/// Read-only view of a session for the presentation surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub conn_id: String,
    pub device_id: Option<String>,
    pub display_name: String,
    pub platform: String,
    pub remote_addr: Option<String>,
    pub connected_at: String,
    pub last_seen: String,
}

impl From<&DeviceSession> for SessionView {
    fn from(session: &DeviceSession) -> Self {
        Self {
            conn_id: session.conn_id.clone(),
            device_id: session.device_id.clone(),
            display_name: session.display_name.clone(),
            platform: session.platform.clone(),
            remote_addr: session.remote_addr.map(|addr| addr.to_string()),
            connected_at: format_timestamp(session.connected_at),
            last_seen: format_timestamp(session.last_seen),
        }
    }
}

/// Generate a unique connection handle.
pub fn generate_conn_id() -> String {
    format!("conn-{}", Uuid::new_v4())
}

/// The set of currently connected agents, keyed by connection handle, with a
/// secondary index by device identifier. The registry exclusively owns the
/// session records; everything else goes through the operations below.
pub struct SessionRegistry {
    sessions: DashMap<String, DeviceSession>,
    by_device: DashMap<String, String>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SessionRegistry {
    pub fn new(events: broadcast::Sender<ControllerEvent>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_device: DashMap::new(),
            events,
        }
    }

    /// A new transport connected. Creates the unregistered entry and prompts
    /// the agent to register. Always succeeds.
    pub fn on_connect(
        &self,
        conn_id: &str,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<ControllerMessage>,
    ) {
        let now = Utc::now();
        let session = DeviceSession {
            conn_id: conn_id.to_string(),
            device_id: None,
            display_name: format!("device-{}", &conn_id[..conn_id.len().min(11)]),
            platform: "unknown".to_string(),
            remote_addr,
            connected_at: now,
            last_seen: now,
            tx,
        };
        self.sessions.insert(conn_id.to_string(), session);
        info!(conn_id, remote_addr = ?remote_addr, "agent connected, requesting registration");
        let _ = self.send_to(
            conn_id,
            ControllerMessage::RegistrationPrompt {
                message: "Please register device.".to_string(),
            },
        );
    }

    /// Promote the placeholder entry to a live device session. Rejects empty
    /// identifiers. A second connection registering an identifier that is
    /// already indexed wins the index; the older connection's entry stays
    /// until its own disconnect.
    pub fn on_register(
        &self,
        conn_id: &str,
        device_id: &str,
        display_name: Option<&str>,
        platform: Option<&str>,
    ) -> Result<(), ControlError> {
        if device_id.is_empty() {
            warn!(conn_id, "registration rejected: empty device identifier");
            let _ = self.send_to(
                conn_id,
                ControllerMessage::RegistrationError {
                    message: "Missing device identifier in registration payload.".to_string(),
                },
            );
            return Err(ControlError::MissingIdentifier);
        }

        let mut session = self
            .sessions
            .get_mut(conn_id)
            .ok_or_else(|| ControlError::UnknownSender(conn_id.to_string()))?;
        let previous_device = session.device_id.replace(device_id.to_string());
        if let Some(name) = display_name {
            session.display_name = name.to_string();
        }
        if let Some(platform) = platform {
            session.platform = platform.to_string();
        }
        session.last_seen = Utc::now();
        let display_name = session.display_name.clone();
        let platform = session.platform.clone();
        let remote_addr = session.remote_addr;
        drop(session);

        // A handle changing identity must release its old index entry, or
        // the old identifier would keep resolving to this session.
        if let Some(old) = previous_device {
            if old != device_id {
                warn!(
                    conn_id,
                    old_device = %old,
                    new_device = %device_id,
                    "connection re-registered under a different identifier"
                );
                self.by_device.remove_if(&old, |_, indexed| indexed == conn_id);
            }
        }

        if let Some(previous) = self
            .by_device
            .insert(device_id.to_string(), conn_id.to_string())
        {
            if previous != conn_id {
                warn!(
                    device_id,
                    previous_conn = %previous,
                    new_conn = %conn_id,
                    "device identifier re-registered on a new connection; index now points at the newer session"
                );
            }
        }

        info!(
            device_id,
            conn_id,
            display_name = %display_name,
            remote_addr = ?remote_addr,
            "device registered"
        );
        let _ = self.send_to(
            conn_id,
            ControllerMessage::RegistrationAck {
                message: "Successfully registered.".to_string(),
                conn_id: conn_id.to_string(),
                device_id: device_id.to_string(),
            },
        );
        let _ = self.events.send(ControllerEvent::DeviceRegistered {
            device_id: device_id.to_string(),
            conn_id: conn_id.to_string(),
            display_name,
            platform,
        });
        Ok(())
    }

    /// Bump `last_seen` for a known handle. Unknown handles are recoverable:
    /// the caller should re-issue the registration prompt.
    pub fn on_heartbeat(&self, conn_id: &str) -> Result<(), ControlError> {
        match self.sessions.get_mut(conn_id) {
            Some(mut session) => {
                session.last_seen = Utc::now();
                Ok(())
            }
            None => Err(ControlError::UnknownSender(conn_id.to_string())),
        }
    }

    /// Bump `last_seen` for any inbound message on the handle.
    pub fn touch(&self, conn_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(conn_id) {
            session.last_seen = Utc::now();
        }
    }

    /// Explicit teardown on transport disconnect. The identifier index entry
    /// is removed only if it still points at this handle, so a newer session
    /// for the same identifier is never un-indexed by an old connection
    /// going away.
    pub fn on_disconnect(&self, conn_id: &str) {
        let Some((_, session)) = self.sessions.remove(conn_id) else {
            warn!(conn_id, "unknown connection disconnected");
            return;
        };
        if let Some(device_id) = &session.device_id {
            self.by_device
                .remove_if(device_id, |_, indexed| indexed == conn_id);
        }
        info!(
            conn_id,
            device_id = ?session.device_id,
            "agent disconnected"
        );
        let _ = self.events.send(ControllerEvent::DeviceDisconnected {
            device_id: session.device_id,
            conn_id: conn_id.to_string(),
        });
    }

    /// Resolve a target to a live connection handle.
    pub fn resolve(&self, target: &Target) -> Result<String, ControlError> {
        match target {
            Target::Handle(conn_id) => {
                if self.sessions.contains_key(conn_id) {
                    Ok(conn_id.clone())
                } else {
                    Err(ControlError::TargetNotLive(conn_id.clone()))
                }
            }
            Target::Device(device_id) => {
                let conn_id = self
                    .by_device
                    .get(device_id)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| ControlError::TargetNotLive(device_id.clone()))?;
                if self.sessions.contains_key(&conn_id) {
                    Ok(conn_id)
                } else {
                    debug!(%device_id, %conn_id, "identifier index pointed at a dead handle");
                    Err(ControlError::TargetNotLive(device_id.clone()))
                }
            }
        }
    }

    /// Device identifier registered on a handle, if any.
    pub fn device_of(&self, conn_id: &str) -> Option<String> {
        self.sessions
            .get(conn_id)
            .and_then(|session| session.device_id.clone())
    }

    /// Queue a message on the handle's outbound channel. A closed channel
    /// means the writer task is gone and the session is effectively dead.
    pub fn send_to(&self, conn_id: &str, message: ControllerMessage) -> Result<(), ControlError> {
        let session = self
            .sessions
            .get(conn_id)
            .ok_or_else(|| ControlError::TargetNotLive(conn_id.to_string()))?;
        session
            .tx
            .send(message)
            .map_err(|_| ControlError::TargetNotLive(conn_id.to_string()))
    }

    pub fn snapshot(&self) -> Vec<SessionView> {
        self.sessions
            .iter()
            .map(|entry| SessionView::from(entry.value()))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    fn indexed_handle(&self, device_id: &str) -> Option<String> {
        self.by_device.get(device_id).map(|e| e.value().clone())
    }
}
