//! Watch directories and print reconciled change events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use codex_file_monitor::{
    ChangeEvent, ChannelCallbacks, FileMonitor, MonitorConfig, MonitorEvent, WatchHandle,
    pair_renames,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "codex-file-monitor",
    version,
    about = "Watch directories and print file changes"
)]
struct Cli {
    /// Only watch the direct children of each directory.
    #[arg(long)]
    non_recursive: bool,

    /// TOML file with monitor settings.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print one JSON object per line instead of text.
    #[arg(long)]
    json: bool,

    /// Directories to watch.
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let monitor = FileMonitor::start(config)?;

    let (callbacks, mut events) = ChannelCallbacks::new();
    let mut roots = HashMap::new();
    for path in &cli.paths {
        let handle = monitor.register(path.clone(), !cli.non_recursive, callbacks.clone())?;
        roots.insert(handle, path.clone());
    }
    drop(callbacks);

    let printer = Printer {
        json: cli.json,
        roots,
    };
    let mut live = cli.paths.len();

    while live > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let handle = event.handle();
                let root = printer.root(handle).display();
                match event {
                    MonitorEvent::Registered { tree, .. } => {
                        let directories = tree.iter().filter(|e| e.is_directory).count();
                        info!(
                            "Watching {root} ({} entries, {directories} directories)",
                            tree.len()
                        );
                    }
                    MonitorEvent::RegistrationFailed { error, .. } => {
                        error!("Cannot watch {root}: {error}");
                        live -= 1;
                    }
                    MonitorEvent::MonitoringFailed { error, .. } => {
                        warn!("Stopped watching {root}: {error}");
                        live -= 1;
                    }
                    MonitorEvent::FilesChanged { events, .. } => printer.print(handle, &events)?,
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || monitor.stop()).await??;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MonitorConfig> {
    let Some(path) = path else {
        return Ok(MonitorConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: MonitorConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

struct Printer {
    json: bool,
    roots: HashMap<WatchHandle, PathBuf>,
}

impl Printer {
    fn root(&self, handle: WatchHandle) -> &Path {
        self.roots
            .get(&handle)
            .map(PathBuf::as_path)
            .unwrap_or_else(|| Path::new("?"))
    }

    fn print(&self, handle: WatchHandle, events: &[ChangeEvent]) -> anyhow::Result<()> {
        let root = self.root(handle);

        if self.json {
            for event in events {
                let line = json!({
                    "watch": handle.id(),
                    "root": root,
                    "event": event,
                });
                println!("{}", serde_json::to_string(&line)?);
            }
            return Ok(());
        }

        for event in events {
            let suffix = if event.file.is_directory { "/" } else { "" };
            println!(
                "{:<8} {}{suffix}",
                event.kind,
                root.join(event.path()).display()
            );
        }
        for (from, to) in pair_renames(events) {
            println!(
                "renamed  {} -> {}",
                root.join(from).display(),
                root.join(to).display()
            );
        }
        Ok(())
    }
}
