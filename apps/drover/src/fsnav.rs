use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::dispatcher::{CommandDispatcher, DispatchReceipt};
use crate::error::ControlError;
use crate::protocol::{ControllerEvent, OP_LIST_FILES};
use crate::registry::Target;

/// Directory entry as the agent reports it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawEntry {
    pub name: String,
    pub path: Option<String>,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: i64,
    pub can_read: bool,
    pub can_write: bool,
}

impl Default for RawEntry {
    fn default() -> Self {
        Self {
            name: "Unknown".to_string(),
            path: None,
            is_directory: false,
            size: 0,
            last_modified: 0,
            can_read: false,
            can_write: false,
        }
    }
}

/// Directory entry with the derived fields the presentation layer renders.
/// Entries are neither sorted nor deduplicated here; that is left to the
/// consuming observer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntryView {
    pub name: String,
    pub path: String,
    pub kind: &'static str,
    pub size_bytes: u64,
    pub size_display: String,
    pub modified: String,
    pub permissions: String,
}

impl EntryView {
    fn from_raw(listing_path: &str, raw: RawEntry) -> Self {
        let kind = if raw.is_directory { "dir" } else { "file" };
        let size_display = if raw.is_directory {
            "<DIR>".to_string()
        } else {
            format!("{:.1}", raw.size as f64 / 1024.0)
        };
        let modified = if raw.last_modified > 0 {
            chrono::DateTime::from_timestamp_millis(raw.last_modified)
                .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "N/A".to_string())
        } else {
            "N/A".to_string()
        };
        let mut permissions = String::new();
        if raw.can_read {
            permissions.push('r');
        }
        if raw.can_write {
            permissions.push('w');
        }
        if permissions.is_empty() {
            permissions.push('-');
        }
        let path = raw
            .path
            .unwrap_or_else(|| join_remote(listing_path, &raw.name));
        Self {
            name: raw.name,
            path,
            kind,
            size_bytes: raw.size,
            size_display,
            modified,
            permissions,
        }
    }
}

fn join_remote(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Parent of a remote path by segment rules: drop the trailing segment,
/// root's parent is root.
pub fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

fn normalize_request_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Controller-side browsing affordance: one "current path" per device,
/// advanced only by successful listing responses so "refresh" always
/// re-issues whatever was last actually shown.
pub struct RemoteFsNavigator {
    dispatcher: Arc<CommandDispatcher>,
    current_path: DashMap<String, String>,
    listings: DashMap<String, Vec<EntryView>>,
    events: broadcast::Sender<ControllerEvent>,
}

impl RemoteFsNavigator {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            dispatcher,
            current_path: DashMap::new(),
            listings: DashMap::new(),
            events,
        }
    }

    /// Ask the device to list `path`. The stored current path does not move
    /// until the response lands.
    pub fn request(&self, device_id: &str, path: &str) -> Result<DispatchReceipt, ControlError> {
        let path = normalize_request_path(path);
        self.dispatcher.dispatch(
            &Target::Device(device_id.to_string()),
            OP_LIST_FILES,
            json!({ "path": path }),
        )
    }

    /// Apply a successful listing response payload
    /// (`{"path": ..., "files": [...]}`).
    pub fn on_listing(&self, device_id: &str, payload: &Value) -> Result<(), ControlError> {
        let path = payload
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::MalformedPayload("listing missing 'path'".into()))?
            .to_string();
        let raw_entries: Vec<RawEntry> = payload
            .get("files")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| ControlError::MalformedPayload(format!("bad 'files' array: {err}")))?
            .unwrap_or_default();

        let entries: Vec<EntryView> = raw_entries
            .into_iter()
            .map(|raw| EntryView::from_raw(&path, raw))
            .collect();
        info!(
            device_id,
            path,
            entries = entries.len(),
            "directory listing updated"
        );
        let _ = self.events.send(ControllerEvent::DirectoryListed {
            device_id: device_id.to_string(),
            path: path.clone(),
            entries: entries.len(),
        });
        self.current_path.insert(device_id.to_string(), path);
        self.listings.insert(device_id.to_string(), entries);
        Ok(())
    }

    /// Re-issue a listing for the parent of the stored current path.
    pub fn go_up(&self, device_id: &str) -> Result<DispatchReceipt, ControlError> {
        let parent = parent_path(&self.current_path(device_id));
        self.request(device_id, &parent)
    }

    pub fn current_path(&self, device_id: &str) -> String {
        self.current_path
            .get(device_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn listing(&self, device_id: &str) -> Vec<EntryView> {
        self.listings
            .get(device_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{generate_conn_id, SessionRegistry};
    use tokio::sync::mpsc;

    fn fixture() -> (Arc<SessionRegistry>, RemoteFsNavigator) {
        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(SessionRegistry::new(events.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), events.clone()));
        (registry.clone(), RemoteFsNavigator::new(dispatcher, events))
    }

    fn connect_registered(
        registry: &SessionRegistry,
        device_id: &str,
    ) -> mpsc::UnboundedReceiver<crate::protocol::ControllerMessage> {
        let conn_id = generate_conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.on_connect(&conn_id, None, tx);
        registry.on_register(&conn_id, device_id, None, None).unwrap();
        rx
    }

    #[test]
    fn parent_path_segment_rules() {
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path(""), "/");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/a/b"), "/a");
        assert_eq!(parent_path("/a/b/"), "/a");
    }

    #[tokio::test]
    async fn request_does_not_move_current_path() {
        let (registry, nav) = fixture();
        let _agent_rx = connect_registered(&registry, "dev1");
        nav.request("dev1", "/sdcard").unwrap();
        assert_eq!(nav.current_path("dev1"), "/");
    }

    #[tokio::test]
    async fn listing_moves_current_path_and_derives_fields() {
        let (registry, nav) = fixture();
        let _agent_rx = connect_registered(&registry, "dev1");
        let payload = json!({
            "path": "/sdcard",
            "files": [
                {"name": "DCIM", "path": "/sdcard/DCIM", "isDirectory": true,
                 "size": 0, "lastModified": 0, "canRead": true, "canWrite": true},
                {"name": "notes.txt", "isDirectory": false, "size": 2048,
                 "lastModified": 1700000000000i64, "canRead": true, "canWrite": false},
            ],
        });
        nav.on_listing("dev1", &payload).unwrap();

        assert_eq!(nav.current_path("dev1"), "/sdcard");
        let entries = nav.listing("dev1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "dir");
        assert_eq!(entries[0].size_display, "<DIR>");
        assert_eq!(entries[0].permissions, "rw");
        assert_eq!(entries[1].kind, "file");
        assert_eq!(entries[1].size_display, "2.0");
        assert_eq!(entries[1].permissions, "r");
        // Path falls back to a join with the listing path.
        assert_eq!(entries[1].path, "/sdcard/notes.txt");
    }

    #[tokio::test]
    async fn go_up_from_root_stays_at_root() {
        let (registry, nav) = fixture();
        let _agent_rx = connect_registered(&registry, "dev1");
        nav.go_up("dev1").unwrap();
        assert_eq!(nav.current_path("dev1"), "/");
    }

    #[tokio::test]
    async fn malformed_listing_leaves_state_unchanged() {
        let (registry, nav) = fixture();
        let _agent_rx = connect_registered(&registry, "dev1");
        let err = nav.on_listing("dev1", &json!({"files": []})).unwrap_err();
        assert!(matches!(err, ControlError::MalformedPayload(_)));
        assert_eq!(nav.current_path("dev1"), "/");
        assert!(nav.listing("dev1").is_empty());
    }
}
