//! `markerfuse` – marker fusion command line interface.
//!
//! Subcommands:
//!
//! - `calibrate` – replay recorded frames in learning mode, print the learned
//!   marker pairs, resolve and save the reference table.
//! - `track` – replay recorded frames against a saved table and emit one
//!   fused pose per frame as JSON lines.
//! - `run` – live pipeline: frames are read from a file or stdin and handed
//!   to the timer-driven fusion loop, which calibrates first unless a saved
//!   table is configured.  Ctrl-C stops it.
//! - `show-config` – print the effective configuration.
//! - `init-config` – write the default configuration file.

mod config;
mod replay;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::warn;

use markerfuse_middleware::FrameBus;
use markerfuse_perception::table::ReferenceTransformTable;
use markerfuse_runtime::pipeline::{PipelineSignals, run_fusion_loop};
use markerfuse_runtime::tracker::{EdgeSummary, Tracker};
use markerfuse_types::MarkerId;

use crate::config::Config;
use crate::replay::{BatchReader, PoseWriter, replay_frames};

/// Table written by `calibrate` when neither `--out` nor `table_path` is set.
const DEFAULT_TABLE_FILE: &str = "reference_table.json";

#[derive(Parser)]
#[command(name = "markerfuse", version, about = "Fuse multiple fiducial markers into one object pose")]
struct Cli {
    /// Config file (default: ~/.markerfuse/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Learn marker pairs from recorded frames and save the reference table.
    Calibrate {
        /// JSON-lines frame log, or `-` for stdin.
        #[arg(long)]
        frames: String,
        /// Reference marker (overrides the config).
        #[arg(long)]
        reference: Option<MarkerId>,
        /// Where to write the table.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Fuse recorded frames against a saved table.
    Track {
        #[arg(long)]
        frames: String,
        /// Saved table (overrides the config).
        #[arg(long)]
        table: Option<PathBuf>,
        /// Pose output file (default: stdout).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the live calibrate-then-track pipeline.
    Run {
        #[arg(long, default_value = "-")]
        frames: String,
        /// Wait for the fusion loop to take each frame before sending the
        /// next, so no recorded frame is overwritten.
        #[arg(long)]
        pace: bool,
    },
    /// Print the effective configuration.
    ShowConfig,
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let _guard = markerfuse_runtime::init_tracing("markerfuse");
    let cli = Cli::parse();

    let result = config::load_effective(cli.config.as_deref()).and_then(|cfg| match cli.command {
        Command::Calibrate {
            frames,
            reference,
            out,
        } => calibrate(&cfg, &frames, reference, out),
        Command::Track { frames, table, out } => track(&cfg, &frames, table, out.as_deref()),
        Command::Run { frames, pace } => run_live(&cfg, &frames, pace),
        Command::ShowConfig => show_config(&cfg, cli.config.as_deref()),
        Command::InitConfig { force } => init_config(cli.config.as_deref(), force),
    });

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// calibrate
// ─────────────────────────────────────────────────────────────────────────────

fn calibrate(
    cfg: &Config,
    frames: &str,
    reference: Option<MarkerId>,
    out: Option<PathBuf>,
) -> Result<(), String> {
    let (tracker_config, _) = cfg.validate()?;
    let reference = reference.unwrap_or(tracker_config.reference_id);
    let mut tracker = Tracker::new(tracker_config).map_err(|e| e.to_string())?;

    let batches = BatchReader::new(replay::open_input(frames)?);
    let stats = replay_frames(&mut tracker, batches, |_| Ok(()))?;
    println!(
        "  Learned from {} of {} frame(s)",
        stats.learned.to_string().bold(),
        stats.frames
    );
    if stats.restarts > 0 {
        println!("    {} recording session(s)", stats.restarts + 1);
    }
    if stats.skipped > 0 {
        println!(
            "    {}",
            format!("{} frame(s) skipped: repeated sequence number", stats.skipped).yellow()
        );
    }
    print_edge_report(&tracker.edge_report());

    let table = tracker.resolve(reference).map_err(|e| e.to_string())?;
    let path = out
        .or_else(|| cfg.table_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TABLE_FILE));
    table.save(&path).map_err(|e| e.to_string())?;
    print_table(table);
    println!(
        "\n  {} Table saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// track
// ─────────────────────────────────────────────────────────────────────────────

fn track(
    cfg: &Config,
    frames: &str,
    table: Option<PathBuf>,
    out: Option<&Path>,
) -> Result<(), String> {
    let (tracker_config, _) = cfg.validate()?;
    let table_path = table
        .or_else(|| cfg.table_path.clone())
        .ok_or("No reference table given; pass --table or set table_path")?;
    let table = ReferenceTransformTable::load(&table_path).map_err(|e| e.to_string())?;
    let mut tracker = Tracker::from_table(tracker_config, table).map_err(|e| e.to_string())?;

    let mut writer = PoseWriter::new(replay::open_output(out)?);
    let stats = replay_frames(
        &mut tracker,
        BatchReader::new(replay::open_input(frames)?),
        |pose| writer.write(pose),
    )?;
    writer.finish()?;
    eprintln!(
        "  {} {} pose(s) from {} frame(s)",
        "✓".green().bold(),
        stats.fused,
        stats.frames
    );
    if stats.skipped > 0 {
        eprintln!(
            "    {}",
            format!("{} frame(s) skipped: repeated sequence number", stats.skipped).yellow()
        );
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

fn run_live(cfg: &Config, frames: &str, pace: bool) -> Result<(), String> {
    let (tracker_config, pipeline_config) = cfg.validate()?;
    let tracker = match &cfg.table_path {
        Some(path) if path.exists() => {
            let table = ReferenceTransformTable::load(path).map_err(|e| e.to_string())?;
            eprintln!("  Using saved table {}", path.display().to_string().bold());
            Tracker::from_table(tracker_config, table)
        }
        _ => {
            eprintln!(
                "  Calibrating for up to {}s against marker {}",
                pipeline_config.calibration_window.as_secs(),
                tracker_config.reference_id.to_string().bold()
            );
            Tracker::new(tracker_config)
        }
    }
    .map_err(|e| e.to_string())?;

    let signals = PipelineSignals::default();
    let shutdown = signals.shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – stopping …".yellow().bold());
        shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let bus = FrameBus::default();
    let pace = pace.then_some(pipeline_config.fusion_interval);
    spawn_producer(replay::open_input(frames)?, bus.clone(), signals.clone(), pace);

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start async runtime: {e}"))?;
    let (result, printed) = runtime.block_on(async move {
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let printer = tokio::spawn(print_poses(bus.clone(), done_rx));
        let result = run_fusion_loop(tracker, bus, pipeline_config, signals).await;
        let _ = done_tx.send(true);
        let printed = match printer.await {
            Ok(printed) => printed,
            Err(e) => Err(format!("Pose printer failed: {e}")),
        };
        (result, printed)
    });

    let (_, report) = result.map_err(|e| e.to_string())?;
    let printed = printed?;
    eprintln!(
        "  {} {} frame(s), {} pose(s) written{}",
        "✓".green().bold(),
        report.frames_processed,
        printed,
        match report.resolved_markers {
            Some(n) => format!(", {n} marker(s) resolved"),
            None => ", calibration not finished".to_string(),
        }
    );
    Ok(())
}

/// Read frames on a plain thread so a blocking stdin read never holds up
/// shutdown.  With `pace`, each frame waits until the fusion loop has taken
/// the previous one, polling once per `pace` period.
fn spawn_producer(
    input: Box<dyn std::io::BufRead + Send>,
    bus: FrameBus,
    signals: PipelineSignals,
    pace: Option<Duration>,
) {
    std::thread::spawn(move || {
        for item in BatchReader::new(input) {
            if signals.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let sequence = match item {
                // Out-of-order frames are logged by the bus.
                Ok(batch) => bus.publish_frame(batch).ok(),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable frame");
                    None
                }
            };
            if let (Some(period), Some(sequence)) = (pace, sequence) {
                while bus.consumed_sequence().is_none_or(|taken| taken < sequence)
                    && !signals.shutdown.load(Ordering::SeqCst)
                {
                    std::thread::sleep(period);
                }
            }
        }
        signals.input_finished.store(true, Ordering::SeqCst);
    });
}

/// Write every published pose to stdout until `done` flips.
async fn print_poses(
    bus: FrameBus,
    mut done: tokio::sync::watch::Receiver<bool>,
) -> Result<u64, String> {
    let mut poses = bus.subscribe_poses();
    drop(bus);
    let mut writer = PoseWriter::new(std::io::stdout());
    loop {
        tokio::select! {
            changed = poses.changed() => {
                if changed.is_err() {
                    break;
                }
                let pose = poses.borrow_and_update().clone();
                if let Some(pose) = pose {
                    writer.write(&pose)?;
                }
            }
            _ = done.changed() => {
                if poses.has_changed().unwrap_or(false) {
                    let pose = poses.borrow_and_update().clone();
                    if let Some(pose) = pose {
                        writer.write(&pose)?;
                    }
                }
                break;
            }
        }
    }
    let written = writer.written();
    writer.finish()?;
    Ok(written)
}

// ─────────────────────────────────────────────────────────────────────────────
// show-config
// ─────────────────────────────────────────────────────────────────────────────

fn show_config(cfg: &Config, path: Option<&Path>) -> Result<(), String> {
    let source = path.map(Path::to_path_buf).unwrap_or_else(config::config_path);
    let status = if source.exists() {
        "loaded".green()
    } else {
        "not found, using defaults".yellow()
    };
    println!("  Config {} ({})", source.display().to_string().bold(), status);
    cfg.validate()?;
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to render config: {e}"))?;
    println!();
    for line in raw.lines() {
        println!("    {line}");
    }
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> Result<(), String> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config::config_path);
    config::init_config(&path, force)?;
    println!(
        "  {} Default config written to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Output helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_edge_report(edges: &[EdgeSummary]) {
    println!();
    println!("  {}", "Marker pairs".bold().cyan());
    if edges.is_empty() {
        println!("    {}", "no marker pairs were seen together".dimmed());
        return;
    }
    for edge in edges {
        let [x, y, z] = edge.transform.translation;
        println!(
            "    {:>4} → {:<4} {:>6} obs   t = [{:+.4}, {:+.4}, {:+.4}]",
            edge.from, edge.to, edge.updates, x, y, z
        );
    }
}

fn print_table(table: &ReferenceTransformTable) {
    println!();
    println!(
        "  {} (reference {})",
        "Reference table".bold().cyan(),
        table.reference_id().to_string().bold()
    );
    if table.is_empty() {
        println!("    {}", "no marker could be linked to the reference".yellow());
    }
    for (id, transform) in table.iter() {
        let t = transform.translation;
        println!(
            "    {:>4}  t = [{:+.4}, {:+.4}, {:+.4}]  angle = {:.3} rad",
            id,
            t.x,
            t.y,
            t.z,
            transform.rotation.angle()
        );
    }
}
