use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use noshow_predictor::config::{AgeFilterPolicy, Config, TrainingConfig};
use noshow_predictor::db::{DocumentStore, MemoryStore, PgDocumentStore};
use noshow_predictor::logging::{self, LogFormat};
use noshow_predictor::pipeline::{Orchestrator, PipelineSupervisor, StatusTracker};
use noshow_predictor::predictor::Predictor;
use noshow_predictor::registry::ArtifactRegistry;
use noshow_predictor::report;
use noshow_predictor::service::{PredictionService, DEFAULT_HISTORY_LIMIT, DEFAULT_SAMPLE_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgeFilter {
    /// Hard [0, 120] bounds plus the 1.5 IQR rule
    Iqr,
    /// Hard [0, 120] bounds only
    HardBounds,
}

#[derive(Parser)]
#[command(name = "noshow-predictor")]
#[command(about = "Appointment no-show training pipeline and predictor", long_about = None)]
struct Cli {
    /// Postgres URL; without it documents live in memory for this process
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, env = "DATASET_PATH", default_value = "data/dataset.csv", global = true)]
    dataset: PathBuf,

    #[arg(long, env = "ARTIFACT_DIR", default_value = "models", global = true)]
    artifact_dir: PathBuf,

    #[arg(long, env = "AGE_FILTER", value_enum, default_value_t = AgeFilter::Iqr, global = true)]
    age_filter: AgeFilter,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Run the training pipeline in the foreground
    Train {
        /// One small grid point per model family
        #[arg(long, env = "QUICK_SEARCH")]
        quick: bool,
    },
    /// Train in the background and answer JSON-line requests from stdin
    Serve {
        #[arg(long, env = "QUICK_SEARCH")]
        quick: bool,
    },
    /// Score one appointment given as a JSON object
    Predict {
        #[arg(long)]
        input: String,
    },
    /// Show the pipeline status
    Status,
    /// Show the latest model evaluation
    Metrics,
    /// Show the selected model's confusion matrix
    ConfusionMatrix,
    /// Show a sample of cleaned records
    CleanedSample {
        #[arg(long, default_value_t = DEFAULT_SAMPLE_LIMIT)]
        limit: usize,
    },
    /// Show recent predictions
    History {
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// Generate a markdown training report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

impl Cli {
    fn config(&self, quick: bool) -> Config {
        let policy = match self.age_filter {
            AgeFilter::Iqr => AgeFilterPolicy::default(),
            AgeFilter::HardBounds => AgeFilterPolicy::HardBoundsOnly,
        };
        let training = if quick {
            TrainingConfig::quick()
        } else {
            TrainingConfig::full()
        };
        Config::new(&self.dataset, &self.artifact_dir)
            .with_training(training)
            .with_age_filter(policy)
    }

    async fn store(&self) -> anyhow::Result<Arc<dyn DocumentStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgDocumentStore::connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                Ok(Arc::new(store))
            }
            None => {
                warn!("DATABASE_URL not set, documents are kept in memory only");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    fn service(&self, store: Arc<dyn DocumentStore>) -> PredictionService {
        let predictor = Arc::new(Predictor::new(ArtifactRegistry::new(&self.artifact_dir)));
        PredictionService::new(predictor, store)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_format);

    match &cli.command {
        Commands::InitDb => {
            let url = cli
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to a Postgres instance")?;
            let store = PgDocumentStore::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            store.init_db().await.context("failed to run migrations")?;
            println!("Schema ready.");
        }
        Commands::Train { quick } => {
            let store = cli.store().await?;
            let orchestrator = Orchestrator::new(cli.config(*quick), store);
            let run = orchestrator.run().await.context("training pipeline failed")?;

            println!("Training run {} complete.", run.run_id);
            for (rank, (family, result)) in report::rank_by_f1(&run).into_iter().enumerate() {
                println!(
                    "{}. {} F1 {:.4} precision {:.4} recall {:.4} accuracy {:.4}",
                    rank + 1,
                    family,
                    result.f1,
                    result.precision,
                    result.recall,
                    result.accuracy
                );
            }
            println!("Selected model: {}", run.best_model);
        }
        Commands::Serve { quick } => {
            let store = cli.store().await?;
            let service = cli.service(Arc::clone(&store));
            if !service.warm_up().await {
                info!("no model yet, predictions wait for the first pipeline run");
            }

            let orchestrator = Arc::new(Orchestrator::new(cli.config(*quick), store));
            let supervisor = PipelineSupervisor::new(orchestrator, service.predictor());
            supervisor.start_once();
            info!("serving JSON-line requests on stdin");

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = service.handle_line(line).await;
                println!("{}", serde_json::to_string(&response)?);
            }

            info!("stdin closed, waiting for the background pipeline");
            if let Some(state) = supervisor.wait().await {
                info!(state = ?state, "background pipeline finished");
            }
        }
        Commands::Predict { input } => {
            let body: serde_json::Value =
                serde_json::from_str(input).context("--input must be a JSON object")?;
            let service = cli.service(cli.store().await?);
            let outcome = service.predict(body).await?;
            print_json(&outcome)?;
        }
        Commands::Status => {
            let status = StatusTracker::new(cli.store().await?).read().await;
            print_json(&status)?;
        }
        Commands::Metrics => {
            let run = cli.service(cli.store().await?).model_metrics().await?;
            print_json(&run)?;
        }
        Commands::ConfusionMatrix => {
            let matrix = cli.service(cli.store().await?).confusion_matrix().await?;
            print_json(&matrix)?;
        }
        Commands::CleanedSample { limit } => {
            let sample = cli.service(cli.store().await?).cleaned_sample(Some(*limit)).await?;
            if sample.is_empty() {
                println!("No cleaned records stored.");
                return Ok(());
            }
            print_json(&sample)?;
        }
        Commands::History { limit } => {
            let history = cli
                .service(cli.store().await?)
                .prediction_history(Some(*limit))
                .await?;
            if history.is_empty() {
                println!("No predictions recorded.");
                return Ok(());
            }
            print_json(&history)?;
        }
        Commands::Report { out } => {
            let store = cli.store().await?;
            let status = StatusTracker::new(Arc::clone(&store)).read().await;
            let run = cli.service(store).model_metrics().await?;
            let report = report::build_report(&run, &status);
            std::fs::write(out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
