#![cfg_attr(test, allow(clippy::expect_used))]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use agent_thread_state::{ThreadPatch, ThreadSnapshot, ThreadStateConfig, ThreadStateStore};
use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

/// Replay thread patches through the reconciler and print the final snapshot.
#[derive(Parser, Debug)]
struct Args {
    /// JSONL file with one thread patch per line.
    #[arg(long)]
    patches: PathBuf,
    /// Snapshot JSON to start from. Defaults to an empty prehire thread.
    #[arg(long)]
    base: Option<PathBuf>,
    #[arg(long, default_value = "replay-thread")]
    thread_id: String,
    /// Source label recorded in the transition audit log.
    #[arg(long, default_value = "replay")]
    source: String,
    /// Write the final snapshot here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ThreadStateConfig::from_env().context("load thread state config")?;
    let base = match &args.base {
        Some(path) => load_snapshot(path)?,
        None => ThreadSnapshot::default(),
    };
    let raw = fs::read_to_string(&args.patches)
        .with_context(|| format!("read patches {}", args.patches.display()))?;
    let patches = parse_patches(&raw)?;

    let snapshot = replay(&config, base, &args.thread_id, &args.source, &patches)?;
    let mut rendered =
        serde_json::to_string_pretty(&snapshot).context("encode final snapshot")?;
    rendered.push('\n');

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create output dir {}", parent.display()))?;
            }
            fs::write(path, rendered)
                .with_context(|| format!("write snapshot {}", path.display()))?;
            info!(path = %path.display(), "final snapshot written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(rendered.as_bytes())
                .context("write snapshot to stdout")?;
        }
    }
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<ThreadSnapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read base snapshot {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse base snapshot {}", path.display()))
}

/// Parses non-empty lines as patches, reporting 1-based line numbers on failure.
fn parse_patches(raw: &str) -> Result<Vec<ThreadPatch>> {
    let mut patches = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let patch = serde_json::from_str::<ThreadPatch>(line)
            .with_context(|| format!("invalid patch on line {}", index + 1))?;
        patches.push(patch);
    }
    if patches.is_empty() {
        bail!("no patches found");
    }
    Ok(patches)
}

fn replay(
    config: &ThreadStateConfig,
    base: ThreadSnapshot,
    thread_id: &str,
    source: &str,
    patches: &[ThreadPatch],
) -> Result<ThreadSnapshot> {
    let store = ThreadStateStore::from_config(config.clone());
    store.seed(thread_id, base);
    for (index, patch) in patches.iter().enumerate() {
        let outcome = store.apply(thread_id, source, patch);
        info!(
            patch = index + 1,
            phase = outcome.snapshot.lifecycle.phase.as_str(),
            changed = ?outcome.changed_fields,
            reset = outcome.engagement_reset,
            task_preserved = outcome.task_preserved,
            "applied patch"
        );
    }
    store
        .snapshot(thread_id)
        .context("replayed thread missing from store")
}
