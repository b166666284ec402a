use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use specdesk_sync::{ServerConfig, SyncConfig, SyncServer};

/// Document sync server for project workspaces
///
/// Serves the documents under each project's document directory over
/// WebSocket. Clients subscribe to a project root, read and write
/// documents with etag checks, and receive a diff for every change the
/// watcher sees on disk.
#[derive(Parser, Debug)]
#[command(name = "specdesk-server")]
#[command(version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SPECDESK_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory under each project root that holds its documents
    #[arg(long, env = "SPECDESK_DOCUMENT_DIR", default_value = "openspec")]
    document_dir: PathBuf,

    /// Files above this size (KiB) are announced without their content
    #[arg(long, env = "SPECDESK_LARGE_FILE_KB", default_value_t = 500)]
    large_file_kb: usize,

    /// Quiet period before a burst of file events is reported (ms)
    #[arg(long, env = "SPECDESK_DEBOUNCE_MS", default_value_t = 300)]
    debounce_ms: u64,

    /// Start watching a project right away instead of on first subscribe
    #[arg(long = "watch", value_name = "PROJECT")]
    watch: Vec<PathBuf>,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            sync: SyncConfig::default()
                .with_document_dir(&self.document_dir)
                .with_large_file_threshold(self.large_file_kb.saturating_mul(1024))
                .with_debounce(Duration::from_millis(self.debounce_ms)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let server = SyncServer::new(cli.server_config());

    for root in &cli.watch {
        let project = server
            .projects()
            .project(root)
            .await
            .with_context(|| format!("cannot open project {}", root.display()))?;
        if project.ensure_watcher().await? {
            info!("Watching {}", project.base_dir().display());
        } else {
            warn!("{} has no document directory yet", project.root().display());
        }
    }

    server
        .run()
        .await
        .with_context(|| format!("sync server on {} stopped", cli.bind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["specdesk-server"]);
        let config = cli.server_config();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.sync.large_file_threshold, 500 * 1024);
        assert_eq!(config.sync.debounce, Duration::from_millis(300));
        assert_eq!(config.sync.document_dir, PathBuf::from("openspec"));
        assert!(cli.watch.is_empty());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "specdesk-server",
            "--bind",
            "0.0.0.0:7000",
            "--large-file-kb",
            "1",
            "--debounce-ms",
            "50",
            "--watch",
            "/a",
            "--watch",
            "/b",
        ]);
        let config = cli.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.sync.large_file_threshold, 1024);
        assert_eq!(config.sync.debounce, Duration::from_millis(50));
        assert_eq!(cli.watch, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
