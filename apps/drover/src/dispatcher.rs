use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::protocol::{format_timestamp, CommandStatus, ControllerEvent, ControllerMessage};
use crate::registry::{SessionRegistry, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Sent,
    ResolvedSuccess,
    ResolvedError,
    Abandoned,
}

/// One in-flight operation, recorded at dispatch time and kept until resolved
/// (or swept by the optional TTL policy).
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub correlation_id: String,
    pub device_id: String,
    pub operation: String,
    pub args: Value,
    pub dispatched_at: DateTime<Utc>,
    pub state: CommandState,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub correlation_id: String,
    pub device_id: String,
    pub operation: String,
    pub dispatched_at: String,
    pub state: CommandState,
}

/// Returned to the caller immediately after the request envelope is queued on
/// the target's connection. Resolution arrives later via `on_response`.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub correlation_id: String,
    pub device_id: String,
}

/// A response attributed to a registered device, handed back to the transport
/// layer so it can route control responses to the stream manager and the
/// filesystem navigator.
#[derive(Debug, Clone)]
pub struct ResolvedResponse {
    pub device_id: String,
    pub operation: String,
    pub status: CommandStatus,
    pub payload: Value,
    pub matched: bool,
}

/// Issues correlated operation requests and records them until a response
/// naming the same correlation id arrives on any connection. Requests and
/// responses are deliberately decoupled: operations may be issued
/// concurrently to the same device and resolve out of order.
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    pending: DashMap<String, PendingCommand>,
    sequence: AtomicU64,
    events: broadcast::Sender<ControllerEvent>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, events: broadcast::Sender<ControllerEvent>) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            sequence: AtomicU64::new(0),
            events,
        }
    }

    /// Correlation ids are time-derived, with a process-wide sequence
    /// appended so two dispatches in the same clock tick can never collide.
    fn next_correlation_id(&self, operation: &str) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{operation}_{nanos}_{seq}")
    }

    /// Resolve the target, transmit the request envelope, and record the
    /// pending command. A target with no live session fails before anything
    /// is recorded; there is no retry.
    pub fn dispatch(
        &self,
        target: &Target,
        operation: &str,
        args: Value,
    ) -> Result<DispatchReceipt, ControlError> {
        let conn_id = self.registry.resolve(target)?;
        let device_id = self
            .registry
            .device_of(&conn_id)
            .unwrap_or_else(|| conn_id.clone());
        let correlation_id = self.next_correlation_id(operation);

        self.registry.send_to(
            &conn_id,
            ControllerMessage::Command {
                operation: operation.to_string(),
                correlation_id: correlation_id.clone(),
                args: args.clone(),
            },
        )?;

        self.pending.insert(
            correlation_id.clone(),
            PendingCommand {
                correlation_id: correlation_id.clone(),
                device_id: device_id.clone(),
                operation: operation.to_string(),
                args,
                dispatched_at: Utc::now(),
                state: CommandState::Sent,
            },
        );
        info!(%device_id, operation, %correlation_id, "dispatched command");
        let _ = self.events.send(ControllerEvent::CommandDispatched {
            device_id: device_id.clone(),
            operation: operation.to_string(),
            correlation_id: correlation_id.clone(),
        });
        Ok(DispatchReceipt {
            correlation_id,
            device_id,
        })
    }

    /// Attribute a response to the device registered on `conn_id` and resolve
    /// the matching pending command, if any. A response from a handle with no
    /// registered identity is discarded (the caller re-prompts). A response
    /// whose correlation id matches nothing is still forwarded to observers
    /// so replies to commands issued before a restart remain visible.
    pub fn on_response(
        &self,
        conn_id: &str,
        operation: &str,
        correlation_id: &str,
        status: CommandStatus,
        payload: Value,
    ) -> Result<ResolvedResponse, ControlError> {
        let device_id = self
            .registry
            .device_of(conn_id)
            .ok_or_else(|| ControlError::UnknownSender(conn_id.to_string()))?;

        let matched = match self.pending.get_mut(correlation_id) {
            Some(mut entry) => {
                entry.state = match status {
                    CommandStatus::Success => CommandState::ResolvedSuccess,
                    CommandStatus::Error => CommandState::ResolvedError,
                };
                true
            }
            None => {
                warn!(%device_id, operation, correlation_id, "response matched no pending command");
                false
            }
        };

        info!(
            %device_id,
            operation,
            correlation_id,
            status = ?status,
            matched,
            "command response received"
        );
        if status == CommandStatus::Error {
            warn!(
                %device_id,
                operation,
                correlation_id,
                payload = %payload,
                "device reported command error"
            );
        }

        let _ = self.events.send(ControllerEvent::CommandResolved {
            device_id: device_id.clone(),
            operation: operation.to_string(),
            correlation_id: correlation_id.to_string(),
            status,
            payload: payload.clone(),
            matched,
        });
        Ok(ResolvedResponse {
            device_id,
            operation: operation.to_string(),
            status,
            payload,
            matched,
        })
    }

    pub fn state_of(&self, correlation_id: &str) -> Option<CommandState> {
        self.pending.get(correlation_id).map(|entry| entry.state)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> Vec<PendingView> {
        self.pending
            .iter()
            .map(|entry| PendingView {
                correlation_id: entry.correlation_id.clone(),
                device_id: entry.device_id.clone(),
                operation: entry.operation.clone(),
                dispatched_at: format_timestamp(entry.dispatched_at),
                state: entry.state,
            })
            .collect()
    }

    /// Optional eviction policy for commands that never get an answer. Off
    /// unless a TTL is configured. Each pass marks expired `Sent` entries
    /// `Abandoned` so they stay visible in the snapshot for one more period,
    /// then drops them on the following pass; resolved entries are never
    /// swept.
    pub fn spawn_ttl_sweeper(self: Arc<Self>, ttl: Duration) {
        tokio::spawn(async move {
            let period = Duration::from_secs(30).min(ttl);
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.sweep_expired(ttl);
            }
        });
    }

    fn sweep_expired(&self, ttl: Duration) {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        self.pending
            .retain(|_, command| command.state != CommandState::Abandoned);
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.state == CommandState::Sent && entry.dispatched_at < cutoff)
            .map(|entry| entry.correlation_id.clone())
            .collect();
        for correlation_id in expired {
            let Some(mut command) = self.pending.get_mut(&correlation_id) else {
                continue;
            };
            command.state = CommandState::Abandoned;
            let device_id = command.device_id.clone();
            let operation = command.operation.clone();
            drop(command);
            warn!(
                %device_id,
                %operation,
                %correlation_id,
                "abandoning command with no response after ttl"
            );
            let _ = self.events.send(ControllerEvent::CommandResolved {
                device_id,
                operation,
                correlation_id,
                status: CommandStatus::Error,
                payload: Value::Null,
                matched: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AgentMessage;
    use crate::registry::generate_conn_id;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn fixture() -> (
        Arc<SessionRegistry>,
        Arc<CommandDispatcher>,
        broadcast::Receiver<ControllerEvent>,
    ) {
        let (events, observer) = broadcast::channel(64);
        let registry = Arc::new(SessionRegistry::new(events.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), events));
        (registry, dispatcher, observer)
    }

    fn connect_registered(
        registry: &SessionRegistry,
        device_id: &str,
    ) -> (String, mpsc::UnboundedReceiver<ControllerMessage>) {
        let conn_id = generate_conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.on_connect(&conn_id, None, tx);
        registry.on_register(&conn_id, device_id, None, None).unwrap();
        (conn_id, rx)
    }

    #[tokio::test]
    async fn dispatch_to_offline_device_creates_no_pending_command() {
        let (_registry, dispatcher, _observer) = fixture();
        let err = dispatcher
            .dispatch(&Target::Device("dev2".into()), "take_picture", json!({}))
            .unwrap_err();
        assert!(matches!(err, ControlError::TargetNotLive(_)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn correlation_ids_are_unique_over_many_dispatches() {
        let (registry, dispatcher, _observer) = fixture();
        let (_conn, _rx) = connect_registered(&registry, "dev1");
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let receipt = dispatcher
                .dispatch(&Target::Device("dev1".into()), "get_location", json!({}))
                .unwrap();
            assert!(seen.insert(receipt.correlation_id));
        }
    }

    #[tokio::test]
    async fn unknown_correlation_id_resolves_nothing() {
        let (registry, dispatcher, _observer) = fixture();
        let (conn, _rx) = connect_registered(&registry, "dev1");
        let receipt = dispatcher
            .dispatch(&Target::Device("dev1".into()), "get_location", json!({}))
            .unwrap();

        let resolved = dispatcher
            .on_response(&conn, "get_location", "bogus-id", CommandStatus::Success, json!({}))
            .unwrap();
        assert!(!resolved.matched);
        assert_eq!(
            dispatcher.state_of(&receipt.correlation_id),
            Some(CommandState::Sent)
        );
    }

    #[tokio::test]
    async fn response_from_unregistered_handle_is_discarded() {
        let (registry, dispatcher, _observer) = fixture();
        let conn_id = generate_conn_id();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.on_connect(&conn_id, None, tx);
        let err = dispatcher
            .on_response(&conn_id, "get_location", "x", CommandStatus::Success, json!({}))
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownSender(_)));
    }

    #[tokio::test]
    async fn ttl_sweep_abandons_then_drops_unanswered_commands() {
        let (registry, dispatcher, _observer) = fixture();
        let (_conn, _rx) = connect_registered(&registry, "dev1");
        let receipt = dispatcher
            .dispatch(&Target::Device("dev1".into()), "get_location", json!({}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // First pass marks the entry abandoned but keeps it visible.
        dispatcher.sweep_expired(Duration::from_secs(0));
        assert_eq!(
            dispatcher.state_of(&receipt.correlation_id),
            Some(CommandState::Abandoned)
        );

        // Second pass drops it.
        dispatcher.sweep_expired(Duration::from_secs(0));
        assert_eq!(dispatcher.state_of(&receipt.correlation_id), None);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn end_to_end_dispatch_and_resolution() {
        let (registry, dispatcher, mut observer) = fixture();
        let (conn, mut agent_rx) = connect_registered(&registry, "dev1");

        let receipt = dispatcher
            .dispatch(&Target::Device("dev1".into()), "get_location", json!({}))
            .unwrap();
        assert_eq!(receipt.device_id, "dev1");
        assert_eq!(
            dispatcher.state_of(&receipt.correlation_id),
            Some(CommandState::Sent)
        );

        // The agent sees the request envelope on its connection.
        agent_rx.recv().await.unwrap(); // registration prompt
        agent_rx.recv().await.unwrap(); // registration ack
        let envelope = agent_rx.recv().await.unwrap();
        let cid = match envelope {
            ControllerMessage::Command {
                operation,
                correlation_id,
                ..
            } => {
                assert_eq!(operation, "get_location");
                correlation_id
            }
            other => panic!("expected command envelope, got {other:?}"),
        };
        assert_eq!(cid, receipt.correlation_id);

        // Simulate the agent's asynchronous reply.
        let reply: AgentMessage = serde_json::from_value(json!({
            "type": "response",
            "operation": "get_location",
            "correlation_id": cid,
            "status": "success",
            "payload": {"lat": 1, "lon": 2},
        }))
        .unwrap();
        let AgentMessage::Response {
            operation,
            correlation_id,
            status,
            payload,
        } = reply
        else {
            panic!("expected response message");
        };
        let resolved = dispatcher
            .on_response(&conn, &operation, &correlation_id, status, payload)
            .unwrap();
        assert!(resolved.matched);
        assert_eq!(resolved.device_id, "dev1");
        assert_eq!(
            dispatcher.state_of(&receipt.correlation_id),
            Some(CommandState::ResolvedSuccess)
        );

        // Observers see the dispatch, then the resolution with the payload.
        loop {
            match observer.recv().await.unwrap() {
                ControllerEvent::CommandResolved {
                    device_id,
                    operation,
                    status,
                    payload,
                    matched,
                    ..
                } => {
                    assert_eq!(device_id, "dev1");
                    assert_eq!(operation, "get_location");
                    assert_eq!(status, CommandStatus::Success);
                    assert_eq!(payload, json!({"lat": 1, "lon": 2}));
                    assert!(matched);
                    break;
                }
                _ => continue,
            }
        }
    }
}
