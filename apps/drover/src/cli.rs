use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// Command-line overrides for the environment-based configuration.
#[derive(Parser, Debug)]
#[command(name = "drover", about = "Device fleet controller")]
pub struct Cli {
    /// Port to listen on (default: DROVER_PORT or 8080)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for archive, stream logs and tags
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Abandon unanswered commands after this many seconds (0 = never)
    #[arg(long)]
    pub command_ttl: Option<u64>,
}

impl Cli {
    pub fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(ttl) = self.command_ttl {
            config.command_ttl_seconds = ttl;
        }
    }
}
