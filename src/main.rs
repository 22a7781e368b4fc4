use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::LevelFilter;

use rpsloop::{
    Config, ConfiguredCounter, Orchestrator, Outcome, PredictionCounter, PredictionService,
    TriggerClient, bootstrap,
    core::db::{ImageRepository, Label, Table},
    model::{CentroidModel, CentroidTrainer},
    pipeline::ingest::ingest_seed,
};

#[derive(Parser)]
#[command(name = "rpsloop")]
#[command(about = "Serve a rock/paper/scissors classifier and retrain it from what it serves")]
struct Cli {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Also write a debug-level log to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the databases and tables, retrying while they are unreachable
    Setup,
    /// Copy a labeled seed dataset (<DIR>/rock, paper, scissors) into the raw data directory
    Ingest {
        #[arg(value_name = "DIR")]
        src: PathBuf,
    },
    /// Classify an image and record it for retraining
    Predict {
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        /// Model directory; defaults to the latest registered version
        #[arg(long, value_name = "DIR")]
        model: Option<PathBuf>,

        /// Count the prediction but never call the workflow engine
        #[arg(long)]
        no_trigger: bool,
    },
    /// Request a retraining run from the workflow engine
    Trigger,
    /// Execute one retraining run: extract, preprocess, train, register
    Run,
    /// Show table sizes, counter value and the latest registered model
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    rpsloop::logging::init(level, args.log_file.as_deref())?;

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Setup => {
            let (store, tracking) = bootstrap::setup(&config).await?;
            store.close().await?;
            tracking.close().await?;
        }
        Command::Ingest { src } => {
            let dest = config.pipeline.raw_dir.clone();
            let copied = tokio::task::spawn_blocking(move || ingest_seed(&src, &dest)).await??;
            for (label, n) in copied {
                println!("{}: {}", label, n);
            }
        }
        Command::Predict {
            image_path,
            model,
            no_trigger,
        } => {
            let (store, tracking) = bootstrap::setup(&config).await?;
            let model_dir = match model {
                Some(dir) => dir,
                None => {
                    let version = tracking
                        .latest_version(&config.tracking.registered_name)
                        .await?
                        .with_context(|| {
                            format!(
                                "No registered '{}' model yet; run the pipeline or pass --model",
                                config.tracking.registered_name
                            )
                        })?;
                    tracking.checkout(&version).await?
                }
            };
            let classifier = CentroidModel::load(&model_dir)?;
            let counter = ConfiguredCounter::from_config(&config.counter, &store).await?;
            let trigger = if no_trigger {
                None
            } else {
                Some(TriggerClient::new(&config.trigger)?)
            };

            let bytes = tokio::fs::read(&image_path)
                .await
                .with_context(|| format!("Failed to read image {:?}", image_path))?;
            let service = PredictionService::new(store.clone(), classifier, counter, trigger);
            let prediction = service.predict(&bytes).await?;
            println!("{}", serde_json::json!({ "prediction": prediction.label }));

            // The response is out; let the background trigger finish before exiting.
            if let Some(handle) = prediction.trigger {
                if let Err(e) = handle.await {
                    log::error!("retraining trigger task did not complete: {}", e);
                }
            }
            store.close().await?;
            tracking.close().await?;
        }
        Command::Trigger => {
            let client = TriggerClient::new(&config.trigger)?;
            let run = client
                .trigger(BTreeMap::new())
                .await
                .with_context(|| format!("Failed to trigger {}", client.endpoint()))?;
            println!("{}", run.run_id);
        }
        Command::Run => {
            let (store, tracking) = bootstrap::setup(&config).await?;
            let mut orchestrator = Orchestrator::new(
                store.clone(),
                tracking.clone(),
                Arc::new(CentroidTrainer::default()),
                config.pipeline.clone(),
                config.tracking.clone(),
            );
            let result = orchestrator.run().await;
            store.close().await?;
            tracking.close().await?;

            let report = result?;
            println!(
                "extracted rock: {}, paper: {}, scissors: {}",
                report.extracted.count(Label::Rock),
                report.extracted.count(Label::Paper),
                report.extracted.count(Label::Scissors),
            );
            match (&report.promotion, report.promoted()) {
                (_, Some(version)) => {
                    println!("promoted {} version {}", version.name, version.version)
                }
                (Some(Outcome::Skipped(reason)), None) => println!("no model promoted: {}", reason),
                _ => println!("no model promoted"),
            }
        }
        Command::Status => {
            let (store, tracking) = bootstrap::setup(&config).await?;
            let counter = ConfiguredCounter::from_config(&config.counter, &store).await?;
            println!("database: {}", store.db_file().display());
            println!("history records: {}", store.count(Table::History).await?);
            println!("pending records: {}", store.count(Table::Pending).await?);
            println!(
                "prediction counter: {}/{}",
                counter.current().await?,
                config.counter.threshold
            );
            match tracking.latest_version(&config.tracking.registered_name).await? {
                Some(v) => println!("latest model: {} v{} (run {})", v.name, v.version, v.run_id),
                None => println!("latest model: none"),
            }
            store.close().await?;
            tracking.close().await?;
        }
    }

    Ok(())
}
