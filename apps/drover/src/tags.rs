use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

/// Free-text label per device identifier, persisted as a single JSON
/// document. Loaded once at startup, saved on every write; a failed save is
/// logged and absorbed so tagging never disturbs protocol state.
pub struct DeviceTagStore {
    path: PathBuf,
    tags: Mutex<HashMap<String, String>>,
}

impl DeviceTagStore {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let tags = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, String>>(&contents) {
                Ok(tags) => {
                    info!(count = tags.len(), path = %path.display(), "loaded device tags");
                    tags
                }
                Err(err) => {
                    error!(path = %path.display(), %err, "device tag file is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            tags: Mutex::new(tags),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<String> {
        self.tags
            .lock()
            .ok()
            .and_then(|tags| tags.get(device_id).cloned())
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.tags
            .lock()
            .map(|tags| tags.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, device_id: &str, tag: &str) {
        if let Ok(mut tags) = self.tags.lock() {
            tags.insert(device_id.to_string(), tag.trim().to_string());
            if let Err(err) = self.save(&tags) {
                error!(path = %self.path.display(), %err, "failed to save device tags");
            }
        }
    }

    fn save(&self, tags: &HashMap<String, String>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(tags)?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("drover-tags-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn set_persists_and_reloads() {
        let path = temp_path();
        let store = DeviceTagStore::load(&path);
        assert_eq!(store.get("dev1"), None);

        store.set("dev1", "  office phone ");
        assert_eq!(store.get("dev1").as_deref(), Some("office phone"));

        let reloaded = DeviceTagStore::load(&path);
        assert_eq!(reloaded.get("dev1").as_deref(), Some("office phone"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let path = temp_path();
        std::fs::write(&path, b"not json").unwrap();
        let store = DeviceTagStore::load(&path);
        assert!(store.all().is_empty());
        std::fs::remove_file(path).unwrap();
    }
}
