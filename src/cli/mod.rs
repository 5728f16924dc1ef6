//! Command-line interface for the campaign pipeline.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Instant;

use crate::core::RawSource;
use crate::pipeline::Pipeline;
use crate::store::StoreReader;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "campaign-pipeline")]
#[command(about = "Field-campaign granule conversion pipeline", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert raw granules into an array store and visualization packets
    Run {
        /// Input granule file, or a directory in batch mode
        input: PathBuf,
        /// Output directory for the store and packet containers
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Explicit source format id (skips auto-detection)
        #[arg(short, long)]
        format: Option<String>,
        /// Process every supported file in the input directory
        #[arg(long)]
        batch: bool,
        /// Limit number of files to process in batch mode
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Detect and print the source format of a granule file
    Detect {
        /// Input granule file
        input: PathBuf,
    },

    /// Print the metadata summary of a finalized array store
    Inspect {
        /// Array store directory
        store: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.len() > 39 {
            format!("{}...", &value[..36])
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}, using defaults",
                    path.display(),
                    e
                );
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            format,
            batch,
            limit,
        } => {
            cmd_run(&input, &output_dir, format.as_deref(), batch, limit, &config);
        }
        Commands::Detect { input } => {
            cmd_detect(&input, &config);
        }
        Commands::Inspect { store } => {
            cmd_inspect(&store);
        }
    }
}

/// Collect supported granule files from a directory, sorted by name.
fn collect_inputs(dir: &PathBuf, limit: Option<usize>) -> std::io::Result<Vec<PathBuf>> {
    let mut inputs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("csv") | Some("ply") | Some("dat")
                )
        })
        .collect();
    inputs.sort();
    if let Some(limit) = limit {
        inputs.truncate(limit);
    }
    Ok(inputs)
}

fn cmd_run(
    input: &PathBuf,
    output_dir: &PathBuf,
    format: Option<&str>,
    batch: bool,
    limit: Option<usize>,
    config: &PipelineConfig,
) {
    let start = Instant::now();
    let pipeline = Pipeline::new(config);

    if batch {
        println!("Processing granules in batch mode...");
        println!("Input directory: {}", input.display());
        println!("Output directory: {}", output_dir.display());

        let inputs = match collect_inputs(input, limit) {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => {
                error!("No supported granule files in {}", input.display());
                std::process::exit(1);
            }
            Err(e) => {
                error!("Failed to scan {}: {}", input.display(), e);
                std::process::exit(1);
            }
        };

        let spinner = create_spinner(&format!("Converting {} granules...", inputs.len()));
        let results = pipeline.run_batch(&inputs, output_dir);
        spinner.finish_and_clear();

        let succeeded = results.iter().filter(|(_, r)| r.is_ok()).count();
        let failed = results.len() - succeeded;
        let total_points: usize = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|o| o.store.point_count)
            .sum();

        for (input, result) in &results {
            if let Err(e) = result {
                error!("{}: {:#}", input.display(), e);
            }
        }

        print_summary(
            "Batch Run Complete",
            &[
                ("Input directory", input.display().to_string()),
                ("Output directory", output_dir.display().to_string()),
                ("Granules", results.len().to_string()),
                ("Succeeded", succeeded.to_string()),
                ("Failed", failed.to_string()),
                ("Total points", total_points.to_string()),
                ("Duration", format!("{:.2?}", start.elapsed())),
            ],
        );

        if failed > 0 {
            std::process::exit(1);
        }
    } else {
        println!("Processing single granule...");
        println!("Input: {}", input.display());

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "granule".to_string());
        let store_dest = output_dir.join(format!("{}.store", stem));
        let viz_dest = output_dir.join(format!("{}.viz.json", stem));

        let source = match format {
            Some(hint) => RawSource::with_hint(input, hint),
            None => RawSource::new(input),
        };

        let spinner = create_spinner("Running conversion pipeline...");
        match pipeline.run(&source, &store_dest, &viz_dest) {
            Ok(output) => {
                spinner.finish_and_clear();
                print_summary(
                    "Pipeline Run Complete",
                    &[
                        ("Input file", input.display().to_string()),
                        ("Format", output.format),
                        ("Points", output.store.point_count.to_string()),
                        ("Chunks", output.store.chunk_count.to_string()),
                        ("Packets", output.viz.packet_count.to_string()),
                        ("Array store", output.store_path.display().to_string()),
                        ("Visualization", output.viz_path.display().to_string()),
                        ("Duration", format!("{:.2?}", start.elapsed())),
                    ],
                );
            }
            Err(e) => {
                spinner.finish_and_clear();
                error!("Pipeline failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn cmd_detect(input: &PathBuf, config: &PipelineConfig) {
    let pipeline = Pipeline::new(config);
    match pipeline.registry().resolve(&RawSource::new(input)) {
        Ok(converter) => {
            println!("{}", converter.format_id());
        }
        Err(e) => {
            error!("Detection failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_inspect(store: &PathBuf) {
    match StoreReader::open(store) {
        Ok(reader) => {
            let meta = reader.metadata();
            let attributes: Vec<&str> = meta
                .arrays
                .keys()
                .map(String::as_str)
                .filter(|name| *name != "location" && *name != "time")
                .collect();
            print_summary(
                "Array Store",
                &[
                    ("Path", store.display().to_string()),
                    ("Format", meta.format.clone()),
                    ("Frame", meta.frame.clone()),
                    ("Points", meta.point_count.to_string()),
                    ("Chunks", meta.num_chunks.to_string()),
                    ("Chunk size", meta.chunk_size.to_string()),
                    ("Epoch", meta.epoch_iso.clone()),
                    ("Attributes", attributes.join(", ")),
                ],
            );
        }
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    }
}
