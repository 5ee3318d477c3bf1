use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use imgprint::{
    Config, FingerprintRecord, FingerprintStore, HashComputer, ImportOutcome, ImportPipeline, PixelWriter, StoreError,
    StoreLoadError, logging,
};

#[derive(Parser, Debug)]
#[command(
    name = "imgprint",
    version,
    about = "Recognise images you have seen before"
)]
struct Cli {
    /// Fingerprint database (default from config)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Config file (default: per-user config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Minimum similarity in percent for a match
    #[arg(long, value_name = "PCT", global = true)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import images, report similar ones already seen and record them
    Import {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Look images up without recording them
    Check {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Import every supported image below a directory
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Re-encode an image and record the written file
    Save {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Work with the fingerprint history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all fingerprint records
    List {
        /// Locations shown per record (default from config)
        #[arg(long, value_name = "N")]
        recent: Option<usize>,
    },

    /// Show where the database lives and its state
    Info,

    /// Remove every record
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("info")?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store_path = db;
    }
    if let Some(threshold) = cli.threshold {
        config.threshold = threshold;
    }
    config.validate()?;

    let mut store = open_store(&config.store_path);
    let pipeline = ImportPipeline::from_config(&config)?;

    match cli.command {
        Commands::Import { files } => {
            for file in &files {
                match pipeline.import_path(&mut store, file) {
                    Ok(outcome) => print_outcome(&outcome),
                    Err(e) => eprintln!("✗ {}", e),
                }
            }
        }

        Commands::Check { files } => {
            for file in &files {
                let identification = match pipeline.identify_path(&store, file) {
                    Ok(identification) => identification,
                    Err(e) => {
                        eprintln!("✗ {}", e);
                        continue;
                    }
                };
                println!("▶ {}", file.display());
                println!("  Fingerprint: {}", identification.fingerprint);
                if identification.report.matches.is_empty() {
                    println!("  Not seen before.");
                }
                for m in identification.report.matches.iter().take(3) {
                    print_match(m.similarity.combined, m.record, m.is_likely_same());
                }
            }
        }

        Commands::Scan { path } => {
            println!("▶ Scanning for images in: {}", path.display());
            let images = scan_directory(&pipeline, &path)?;
            if images.is_empty() {
                println!("No supported images found.");
                return Ok(());
            }

            let bar = ProgressBar::new(images.len() as u64);
            bar.set_style(ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} {msg}",
            )?);
            let results = benchmark("hashing and recording", || {
                pipeline.import_batch(&mut store, &images, |_| bar.inc(1))
            });
            bar.finish_and_clear();

            let mut known = 0;
            let mut failed = 0;
            for (path, result) in &results {
                match result {
                    Ok(outcome) if !outcome.matches.is_empty() => {
                        known += 1;
                        let best = &outcome.matches[0];
                        println!(
                            "  ⚠️ {} resembles {} ({:.1}%)",
                            path.display(),
                            best.record.original_filename,
                            best.similarity.combined
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        failed += 1;
                        eprintln!("  ✗ {}", e);
                    }
                }
            }
            println!(
                "Imported {} image(s): {} previously seen, {} failed, {} record(s) in database",
                results.len() - failed,
                known,
                failed,
                store.len()
            );
        }

        Commands::Save { input, output } => {
            let decoded = HashComputer::decode_path(&input)
                .with_context(|| format!("Failed to decode {:?}", input))?;
            let saved = pipeline.save(&mut store, &decoded.image, &output, &PixelWriter)?;
            println!("✓ Saved {}", saved.path.display());
            println!("  Fingerprint: {}", short(saved.fingerprint.as_str(), 32));
            println!("  Size: {} bytes", saved.file_size);
        }

        Commands::History { command } => match command {
            HistoryCmd::List { recent } => {
                let recent = recent.unwrap_or(config.recent_locations);
                if store.is_empty() {
                    println!("Database is empty.");
                    return Ok(());
                }
                println!("{} distinct image(s):", store.len());
                for (i, (key, record)) in store.all().enumerate() {
                    println!("\n{}. {}", i + 1, key);
                    println!("   Original file: {}", record.original_filename);
                    println!("   First seen:    {}", record.first_seen.to_rfc3339());
                    println!("   Seen:          {} time(s)", record.count);
                    for loc in record.recent_locations(recent) {
                        println!(
                            "     - {} ({})",
                            loc.path,
                            loc.timestamp.format("%Y-%m-%d")
                        );
                    }
                }
            }

            HistoryCmd::Info => {
                let info = store.info();
                match &info.path {
                    Some(path) => println!("Path:     {}", path.display()),
                    None => println!("Path:     (in memory)"),
                }
                if info.exists {
                    println!("Status:   ✓ file exists");
                    println!("Size:     {} bytes", info.size_bytes);
                    println!("Records:  {}", info.records);
                    if let Some(modified) = info.modified {
                        println!("Modified: {}", modified.format("%Y-%m-%d %H:%M:%S"));
                    }
                } else {
                    println!("Status:   ✗ file missing (created on first import)");
                }
            }

            HistoryCmd::Clear { yes } => {
                let confirmed = yes
                    || Confirm::new()
                        .with_prompt(format!(
                            "Remove all {} record(s) from the fingerprint database?",
                            store.len()
                        ))
                        .default(false)
                        .interact()?;
                match store.clear(confirmed) {
                    Ok(removed) => println!("🧹 Removed {} record(s)", removed),
                    Err(StoreError::ConfirmationRequired) => println!("✗ Cancelled"),
                    Err(e) => return Err(e).context("Failed to clear fingerprint database"),
                }
            }
        },
    }

    Ok(())
}

/// Load the database, reporting (but surviving) a missing or corrupt file.
fn open_store(path: &Path) -> FingerprintStore {
    let (store, warning) = FingerprintStore::load(path);
    match warning {
        None => {}
        Some(StoreLoadError::Missing { .. }) => {}
        Some(StoreLoadError::Corrupt {
            backup: Some(backup),
            ..
        }) => {
            eprintln!(
                "⚠️ Fingerprint database was corrupt; moved to {:?}, starting empty",
                backup
            );
        }
        Some(e @ StoreLoadError::Read { .. }) => {
            eprintln!("⚠️ {}; continuing read-only, changes will not be saved", e)
        }
        Some(e) => eprintln!("⚠️ {}; starting empty", e),
    }
    store
}

/// Walk `dir` for supported images behind a spinner.
fn scan_directory(pipeline: &ImportPipeline, dir: &Path) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let images = pipeline.collect_images(dir);

    spinner.finish_with_message(format!("Found {} image(s)", images.len()));
    Ok(images)
}

fn print_outcome(outcome: &ImportOutcome) {
    println!("✓ Imported {}", outcome.filename);
    println!("  Dimensions:  {}x{}", outcome.width, outcome.height);
    if let Some(format) = outcome.format {
        println!("  Format:      {:?}", format);
    }
    println!("  Fingerprint: {}...", short(outcome.fingerprint.as_str(), 32));
    if outcome.skipped > 0 {
        println!("  ({} record(s) could not be compared)", outcome.skipped);
    }

    if outcome.matches.is_empty() {
        println!("  New image.");
        return;
    }
    println!("\n🔍 Similar images already seen:");
    for m in outcome.matches.iter().take(3) {
        print_match(m.similarity.combined, &m.record, m.is_likely_same());
    }
}

fn print_match(similarity: f64, record: &FingerprintRecord, likely_same: bool) {
    println!("  {:.1}% {}", similarity, record.original_filename);
    println!("     First seen: {}", record.first_seen.to_rfc3339());
    if likely_same {
        println!("     ⚠️ Very likely the same image!");
    }
}

fn short(s: &str, n: usize) -> &str {
    s.get(..n).unwrap_or(s)
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
