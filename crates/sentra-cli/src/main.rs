use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use sentra_core::ScanResult;
use sentra_engine::engine::EngineConfig;
use sentra_engine::sink::{sink_from, ResultSink};
use sentra_engine::Engine;

#[derive(Parser)]
#[command(name = "sentra")]
#[command(about = "Sentra endpoint scanning engine", long_about = None)]
struct Cli {
    /// Path to the signature catalog database.
    #[arg(long, default_value = "signatures.db")]
    catalog: PathBuf,

    /// Quarantine repository directory.
    #[arg(long, default_value = "quarantine")]
    quarantine_dir: PathBuf,

    /// Pre-compiled rule set (requires the `yara` build).
    #[cfg(feature = "yara")]
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Emit results as JSON lines instead of human-readable text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a file or directory tree.
    Scan {
        path: PathBuf,

        /// Forensic pass: bypass exclusions, size/trust skips and whitelist.
        #[arg(long)]
        full: bool,
    },

    /// Watch directory roots (separated by ';' or '|') until Enter is pressed.
    Watch { spec: String },

    /// Move a file into the quarantine repository.
    Quarantine { file: PathBuf },

    /// Restore a quarantined file by stored name or stored path.
    Restore { stored: String },

    /// Add a file's SHA-256 to the whitelist.
    Whitelist { file: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let sink = printing_sink(cli.json);

    let config = EngineConfig {
        catalog_path: cli.catalog.clone(),
        quarantine_folder: cli.quarantine_dir.clone(),
    };

    let engine = open_engine(&cli, config, &sink)?;

    match cli.command {
        Commands::Scan { path, full } => {
            engine.set_full_scan(full);
            if path.is_dir() {
                engine.scan_folder(&path, &sink);
            } else {
                engine.scan_file(&path, &sink);
            }
            let (completed, total) = engine.progress_counts();
            info!(completed, total, "scan finished");
        }
        Commands::Watch { spec } => {
            let detections = Arc::new(AtomicU64::new(0));
            let counter = detections.clone();
            let counting_sink: ResultSink = sink_from(move |result: ScanResult| {
                if result.is_malware {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                sink(result);
            });

            engine
                .start_realtime(&spec, counting_sink)
                .context("could not start realtime monitoring")?;
            eprintln!("Watching {spec}. Press Enter to stop.");

            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);

            engine.stop_realtime();
            eprintln!(
                "Stopped. {} detection(s) reported.",
                detections.load(Ordering::Relaxed)
            );
        }
        Commands::Quarantine { file } => println!("{}", engine.quarantine(&file)),
        Commands::Restore { stored } => println!("{}", engine.restore(&stored)),
        Commands::Whitelist { file } => println!("{}", engine.whitelist(&file)),
    }

    engine.shutdown();
    Ok(())
}

#[cfg(feature = "yara")]
fn open_engine(cli: &Cli, config: EngineConfig, sink: &ResultSink) -> Result<Engine> {
    match &cli.rules {
        Some(rules) => Engine::open_with_rules_file(config, rules, Some(sink))
            .context("engine initialization failed"),
        None => Engine::open(config, None, Some(sink)).context("engine initialization failed"),
    }
}

#[cfg(not(feature = "yara"))]
fn open_engine(_cli: &Cli, config: EngineConfig, sink: &ResultSink) -> Result<Engine> {
    Engine::open(config, None, Some(sink)).context("engine initialization failed")
}

fn printing_sink(json: bool) -> ResultSink {
    sink_from(move |result: ScanResult| {
        if json {
            if let Ok(line) = serde_json::to_string(&result) {
                println!("{line}");
            }
            return;
        }
        if result.file_path.is_empty() {
            println!("[{}] {}", result.severity, result.description);
        } else {
            println!(
                "[{}] {} {} - {}",
                result.severity, result.detection_source, result.file_path, result.description
            );
        }
    })
}
