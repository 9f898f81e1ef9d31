use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Seconds before an unanswered command is abandoned; 0 keeps commands
    /// forever.
    pub command_ttl_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("DROVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: env::var("DROVER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("drover_data")),
            command_ttl_seconds: env::var("DROVER_COMMAND_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Folder-per-device archive root; the catalog enumerates it.
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("received_data")
    }

    /// Per-device chunk logs for live capture streams.
    pub fn streams_dir(&self) -> PathBuf {
        self.data_dir.join("streams")
    }

    pub fn tags_file(&self) -> PathBuf {
        self.data_dir.join("device_tags.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("drover_data"),
            command_ttl_seconds: 0,
        }
    }
}
