use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use lane_pipeline::collection::MemoryCorpus;
use lane_pipeline::config::{self, PipelineFileConfig, StageConfig, StageKind};
use lane_pipeline::controller::ParallelController;
use lane_pipeline::log::{init_logging, parse_log_level};
use lane_pipeline::stages::install_stages;
use lane_pipeline::types::EpisodeSummary;

#[derive(Parser)]
#[command(
    name = "lane-pipeline",
    about = "Run a stage pipeline over a collection across parallel lanes"
)]
struct Cli {
    /// Path to the config file. A missing file means defaults.
    #[arg(long, default_value = "lane-pipeline.toml")]
    config: PathBuf,

    /// Log verbosity level (error, warn, info, debug, trace).
    /// Overrides logging.level from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one episode over a synthetic in-memory corpus
    Run {
        /// Number of documents in the corpus
        #[arg(long, default_value = "1000")]
        elements: usize,
        /// Number of lanes (overrides execution.parallelism)
        #[arg(long)]
        parallelism: Option<usize>,
        /// Process only the document at this index
        #[arg(long)]
        target: Option<usize>,
        /// Log per-element failures and carry on instead of stopping
        #[arg(long)]
        keep_going: bool,
        /// Print the episode summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the config file and exit
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let level_name = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    match parse_log_level(level_name) {
        Ok(level) => init_logging(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Run {
            elements,
            parallelism,
            target,
            keep_going,
            json,
        } => handle_run(config, elements, parallelism, target, keep_going, json).await,
        Commands::Check => handle_check(&cli.config, &config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Stages used when the config file declares none.
fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new(StageKind::IdAsFeature),
        StageConfig {
            key: Some("processed".to_string()),
            value: Some("true".to_string()),
            ..StageConfig::new(StageKind::FeatureSetValue)
        },
    ]
}

async fn handle_run(
    config: PipelineFileConfig,
    elements: usize,
    parallelism: Option<usize>,
    target: Option<usize>,
    keep_going: bool,
    json: bool,
) -> Result<(), String> {
    let mut execution = config.execution.clone();
    if let Some(parallelism) = parallelism {
        execution.parallelism = parallelism;
    }
    if keep_going {
        execution.fail_fast = false;
    }

    let mut controller: ParallelController<MemoryCorpus> =
        ParallelController::from_config(execution).map_err(|e| e.to_string())?;

    let stages = if config.stages.is_empty() {
        default_stages()
    } else {
        config.stages.clone()
    };
    install_stages(&mut controller, &stages).map_err(|e| e.to_string())?;

    let corpus = Arc::new(MemoryCorpus::synthetic(elements));
    controller.set_collection(Arc::clone(&corpus));
    if let Some(target) = target {
        if target >= elements {
            return Err(format!(
                "--target {} is out of range: corpus has {} documents",
                target, elements
            ));
        }
        controller.set_target(Some(target));
    }

    // Ctrl-C interrupts the episode cooperatively
    let interrupt = controller.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, interrupting episode");
            interrupt.interrupt();
        }
    });

    info!(
        "Running {} stage(s) over {} document(s): {}",
        controller.stage_count(),
        elements,
        controller.stage_names().join(" -> ")
    );

    let outcome = controller.run_episode().await;
    controller.cleanup();
    let summary = outcome.map_err(|e| e.to_string())?;

    if corpus.resident_count() != 0 {
        warn!(
            "{} document(s) still resident after the episode",
            corpus.resident_count()
        );
    }

    if json {
        let rendered = serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("Failed to render summary: {}", e))?;
        println!("{}", rendered);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &EpisodeSummary) {
    println!("--- Episode Summary ---");
    println!("Mode: {:?} (parallelism {})", summary.mode, summary.parallelism);
    println!(
        "Elements processed: {}/{}",
        summary.elements_processed, summary.elements_total
    );
    if summary.elements_failed > 0 {
        println!("Elements failed: {}", summary.elements_failed);
        for failure in &summary.failures {
            println!("  - {}", failure);
        }
    }
    if summary.stages_skipped > 0 {
        println!("Stages skipped by run conditions: {}", summary.stages_skipped);
    }
}

fn handle_check(path: &Path, config: &PipelineFileConfig) -> Result<(), String> {
    if !path.exists() {
        println!("{} not found; defaults are valid", path.display());
        return Ok(());
    }
    println!(
        "{}: OK (parallelism {}, {} stage(s), fail_fast {})",
        path.display(),
        config.execution.parallelism,
        config.stages.len(),
        config.execution.fail_fast
    );
    Ok(())
}
