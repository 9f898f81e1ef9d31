use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::catalog::sanitize_device_id;
use crate::dispatcher::{CommandDispatcher, DispatchReceipt};
use crate::error::ControlError;
use crate::protocol::{
    CommandStatus, ControllerEvent, OP_START_LIVE_AUDIO, OP_STOP_LIVE_AUDIO,
};
use crate::registry::{SessionRegistry, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

impl StreamState {
    fn as_str(self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Streaming => "streaming",
            StreamState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatusView {
    pub device_id: String,
    pub state: StreamState,
    pub chunks: u64,
    pub bytes: u64,
}

/// Where accepted chunks go. The protocol layer is fire-and-forget with no
/// back-pressure signal to the agent; the sink is the only throttle, so a
/// stricter implementation can be swapped in without touching the state
/// machine.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn append(&self, device_id: &str, bytes: &[u8]) -> std::io::Result<PathBuf>;
}

/// One file per chunk under `<root>/<device>/chunk_<nanos>.bin`. The nanos
/// component is strictly monotonic within the process, so names are unique
/// and a lexicographic read of a device's directory yields arrival order.
pub struct FsChunkSink {
    root: PathBuf,
    last_nanos: AtomicI64,
}

impl FsChunkSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            last_nanos: AtomicI64::new(0),
        }
    }

    fn next_nanos(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut last = self.last_nanos.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_nanos.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

#[async_trait]
impl ChunkSink for FsChunkSink {
    async fn append(&self, device_id: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let dir = self.root.join(sanitize_device_id(device_id));
        tokio::fs::create_dir_all(&dir).await?;
        // Zero-padded so lexicographic order equals numeric order.
        let path = dir.join(format!("chunk_{:020}.bin", self.next_nanos()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamInfo {
    state: StreamState,
    chunks: u64,
    bytes: u64,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            state: StreamState::Idle,
            chunks: 0,
            bytes: 0,
        }
    }
}

/// Tracks the lifecycle of a continuous capture stream per device and
/// persists chunks in arrival order. State is keyed by device identifier,
/// not connection handle, so it survives a reconnect under the same
/// identifier.
pub struct StreamSessionManager {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    sink: Arc<dyn ChunkSink>,
    streams: DashMap<String, StreamInfo>,
    events: broadcast::Sender<ControllerEvent>,
}

impl StreamSessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        sink: Arc<dyn ChunkSink>,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            sink,
            streams: DashMap::new(),
            events,
        }
    }

    fn set_state(&self, device_id: &str, state: StreamState) {
        self.streams.entry(device_id.to_string()).or_default().state = state;
        let _ = self.events.send(ControllerEvent::StreamStatus {
            device_id: device_id.to_string(),
            state: state.as_str().to_string(),
        });
    }

    /// Ask the device to begin capturing. A start while a stream is already
    /// starting or streaming is not rejected: the most recent start wins and
    /// the conflict is logged.
    pub fn start(&self, device_id: &str) -> Result<DispatchReceipt, ControlError> {
        let current = self.state_of(device_id);
        if matches!(current, StreamState::Starting | StreamState::Streaming) {
            warn!(
                device_id,
                state = current.as_str(),
                "start requested while a stream session is already active; newest start wins"
            );
        }
        let receipt = self.dispatcher.dispatch(
            &Target::Device(device_id.to_string()),
            OP_START_LIVE_AUDIO,
            json!({}),
        )?;
        self.set_state(device_id, StreamState::Starting);
        info!(device_id, "stream session starting");
        Ok(receipt)
    }

    /// Ask the device to end capturing. A stop while idle is a no-op that
    /// dispatches nothing.
    pub fn stop(&self, device_id: &str) -> Result<Option<DispatchReceipt>, ControlError> {
        let current = self.state_of(device_id);
        if !matches!(current, StreamState::Starting | StreamState::Streaming) {
            debug!(device_id, state = current.as_str(), "stop ignored, no active stream");
            return Ok(None);
        }
        let receipt = self.dispatcher.dispatch(
            &Target::Device(device_id.to_string()),
            OP_STOP_LIVE_AUDIO,
            json!({}),
        )?;
        self.set_state(device_id, StreamState::Stopping);
        info!(device_id, "stream session stopping");
        Ok(Some(receipt))
    }

    /// Ingest one chunk from the connection it arrived on. Unknown handles
    /// and empty payloads are logged and dropped; a write failure drops only
    /// that chunk and leaves the session streaming.
    pub async fn on_chunk(&self, conn_id: &str, bytes: &[u8]) {
        let Some(device_id) = self.registry.device_of(conn_id) else {
            warn!(conn_id, "stream chunk from unregistered connection, ignoring");
            return;
        };
        if bytes.is_empty() {
            warn!(%device_id, "empty stream chunk, ignoring");
            return;
        }

        // First data while starting acts as the acknowledgment.
        if self.state_of(&device_id) == StreamState::Starting {
            self.set_state(&device_id, StreamState::Streaming);
        }

        match self.sink.append(&device_id, bytes).await {
            Ok(path) => {
                let mut info = self.streams.entry(device_id.clone()).or_default();
                info.chunks += 1;
                info.bytes += bytes.len() as u64;
                drop(info);
                debug!(
                    %device_id,
                    len = bytes.len(),
                    path = %path.display(),
                    "stream chunk persisted"
                );
                let _ = self.events.send(ControllerEvent::StreamChunk {
                    device_id,
                    bytes: bytes.len(),
                });
            }
            Err(err) => {
                let err = ControlError::Persistence(err);
                error!(%device_id, %err, "failed to persist stream chunk, dropping it");
            }
        }
    }

    /// Apply the device's acknowledgment of a start or stop command.
    pub fn on_control_response(&self, device_id: &str, operation: &str, status: CommandStatus) {
        let current = self.state_of(device_id);
        match (operation, status, current) {
            (OP_START_LIVE_AUDIO, CommandStatus::Success, StreamState::Starting) => {
                self.set_state(device_id, StreamState::Streaming);
            }
            (OP_STOP_LIVE_AUDIO, CommandStatus::Success, StreamState::Stopping) => {
                self.set_state(device_id, StreamState::Idle);
            }
            (op, CommandStatus::Error, _)
                if op == OP_START_LIVE_AUDIO || op == OP_STOP_LIVE_AUDIO =>
            {
                warn!(device_id, operation, "stream control command failed on device");
                self.set_state(device_id, StreamState::Idle);
            }
            _ => {}
        }
    }

    /// A stop that never got acknowledged is settled by the transport going
    /// away; other states are kept so a reconnect under the same identifier
    /// resumes where it left off.
    pub fn on_disconnect(&self, device_id: &str) {
        if self.state_of(device_id) == StreamState::Stopping {
            self.set_state(device_id, StreamState::Idle);
        }
    }

    pub fn state_of(&self, device_id: &str) -> StreamState {
        self.streams
            .get(device_id)
            .map(|info| info.state)
            .unwrap_or(StreamState::Idle)
    }

    pub fn status(&self, device_id: &str) -> StreamStatusView {
        let info = self
            .streams
            .get(device_id)
            .map(|entry| *entry.value())
            .unwrap_or_default();
        StreamStatusView {
            device_id: device_id.to_string(),
            state: info.state,
            chunks: info.chunks,
            bytes: info.bytes,
        }
    }
}
