use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::catalog::StoredDeviceCatalog;
use crate::dispatcher::CommandDispatcher;
use crate::error::ControlError;
use crate::fsnav::RemoteFsNavigator;
use crate::protocol::{
    AgentMessage, CommandStatus, ControllerEvent, ControllerMessage, OP_LIST_FILES,
    OP_START_LIVE_AUDIO, OP_STOP_LIVE_AUDIO,
};
use crate::registry::{generate_conn_id, SessionRegistry};
use crate::stream::StreamSessionManager;
use crate::tags::DeviceTagStore;

/// Everything the transport and intent layers share.
#[derive(Clone)]
pub struct ControllerState {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub streams: Arc<StreamSessionManager>,
    pub navigator: Arc<RemoteFsNavigator>,
    pub catalog: Arc<StoredDeviceCatalog>,
    pub tags: Arc<DeviceTagStore>,
    pub events: broadcast::Sender<ControllerEvent>,
}

/// WebSocket upgrade for agents at `/ws/agent`.
pub async fn agent_ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<ControllerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, remote_addr))
}

/// One task per connection: a writer task drains the session's outbound
/// channel into the socket sink, the read loop below feeds inbound frames to
/// the components. Text frames are JSON control messages; binary frames are
/// raw stream chunks.
async fn handle_agent_socket(socket: WebSocket, state: ControllerState, remote_addr: SocketAddr) {
    let conn_id = generate_conn_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControllerMessage>();

    let writer_conn = conn_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(conn_id = %writer_conn, %err, "failed to encode outbound message");
                }
            }
        }
        debug!(conn_id = %writer_conn, "writer task ended");
    });

    state
        .registry
        .on_connect(&conn_id, Some(remote_addr), tx.clone());

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%conn_id, %err, "websocket error, dropping connection");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(agent_msg) => {
                    handle_agent_message(agent_msg, &conn_id, &state, &tx).await;
                }
                Err(err) => {
                    warn!(%conn_id, %err, "malformed agent message, discarding");
                }
            },
            Message::Binary(bytes) => {
                state.registry.touch(&conn_id);
                state.streams.on_chunk(&conn_id, &bytes).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let device_id = state.registry.device_of(&conn_id);
    state.registry.on_disconnect(&conn_id);
    if let Some(device_id) = device_id {
        state.streams.on_disconnect(&device_id);
    }
}

async fn handle_agent_message(
    message: AgentMessage,
    conn_id: &str,
    state: &ControllerState,
    tx: &mpsc::UnboundedSender<ControllerMessage>,
) {
    match message {
        AgentMessage::Register {
            device_id,
            device_name,
            platform,
        } => {
            // Rejections already answered the agent on its channel.
            let _ = state.registry.on_register(
                conn_id,
                &device_id,
                device_name.as_deref(),
                platform.as_deref(),
            );
        }
        AgentMessage::Heartbeat => {
            if state.registry.on_heartbeat(conn_id).is_err() {
                warn!(conn_id, "heartbeat before registration, re-prompting");
                let _ = tx.send(ControllerMessage::RegistrationPrompt {
                    message: "Unrecognized heartbeat, please re-register.".to_string(),
                });
            }
        }
        AgentMessage::Response {
            operation,
            correlation_id,
            status,
            payload,
        } => {
            state.registry.touch(conn_id);
            match state
                .dispatcher
                .on_response(conn_id, &operation, &correlation_id, status, payload)
            {
                Ok(resolved) => route_control_response(state, resolved).await,
                Err(ControlError::UnknownSender(_)) => {
                    warn!(conn_id, "response from unregistered connection, re-prompting");
                    let _ = tx.send(ControllerMessage::RegistrationPrompt {
                        message: "Please register device.".to_string(),
                    });
                }
                Err(err) => {
                    warn!(conn_id, %err, "failed to process command response");
                }
            }
        }
    }
}

/// Hand control responses to the component that issued them.
async fn route_control_response(
    state: &ControllerState,
    resolved: crate::dispatcher::ResolvedResponse,
) {
    match resolved.operation.as_str() {
        OP_START_LIVE_AUDIO | OP_STOP_LIVE_AUDIO => {
            state.streams.on_control_response(
                &resolved.device_id,
                &resolved.operation,
                resolved.status,
            );
        }
        OP_LIST_FILES if resolved.status == CommandStatus::Success => {
            if let Err(err) = state
                .navigator
                .on_listing(&resolved.device_id, &resolved.payload)
            {
                warn!(
                    device_id = %resolved.device_id,
                    %err,
                    "discarding malformed listing response"
                );
            }
        }
        _ => {}
    }
}

/// WebSocket upgrade for passive observers at `/ws/observe`: a one-way feed
/// of controller events as JSON text frames.
pub async fn observer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ControllerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state))
}

async fn handle_observer_socket(socket: WebSocket, state: ControllerState) {
    let mut events = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "observer fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
}
