use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use dte_transmitter::app::ports::{AuthorityCredentials, CredentialProvider, JobQueue};
use dte_transmitter::app::{EngineSettings, TransmissionEngine, TransmissionWorker, WorkerSettings};
use dte_transmitter::config::Config;
use dte_transmitter::domain::{DocumentType, Environment, NewDocument};
use dte_transmitter::infra::{
    Database, MhClient, SigningServiceClient, SqliteDocumentStore, SqliteJobQueue, StaticCredentials,
};
use dte_transmitter::server::{start_server, ApiContext};
use dte_transmitter::{logging, metrics};

#[derive(Parser)]
#[command(name = "dte_transmitter")]
#[command(about = "Sign, transmit and annul electronic tax documents")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $DTE_CONFIG, then ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct AuthArgs {
    /// Authority identity (issuer NIT)
    #[arg(long)]
    identity: String,
    /// Authority secret; looked up in configuration when omitted
    #[arg(long)]
    secret: Option<String>,
    #[arg(long, default_value = "default")]
    tenant: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, plus the queue worker unless disabled
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        no_worker: bool,
    },
    /// Run the queue worker
    Worker {
        /// Process the jobs due now and exit
        #[arg(long)]
        once: bool,
    },
    /// Create a document from a JSON file
    Create {
        /// Type code, e.g. 01 (invoice) or 03 (tax credit invoice)
        #[arg(long = "type")]
        document_type: String,
        /// test | production (or 00 | 01)
        #[arg(long, default_value = "test")]
        environment: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        control_number: Option<String>,
        #[arg(long)]
        establishment: Option<String>,
    },
    /// Transmit a document
    Transmit {
        id: Uuid,
        #[command(flatten)]
        auth: AuthArgs,
        /// Enqueue instead of waiting for the authority
        #[arg(long = "async")]
        queued: bool,
    },
    /// Annul a processed document
    Annul {
        id: Uuid,
        #[arg(long)]
        reason: String,
        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Move a rejected document back to pending retry
    Reopen {
        id: Uuid,
        #[arg(long, default_value = "re-opened by operator")]
        note: String,
    },
    /// Ask the authority for the status of a generation code
    Query {
        generation_code: String,
        #[arg(long, default_value = "test")]
        environment: String,
        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Show a queued job
    Job { id: Uuid },
    /// Show the event log of a document
    Events { id: Uuid },
    /// Delete a document and its events
    Purge { id: Uuid },
}

struct Runtime {
    engine: Arc<TransmissionEngine>,
    queue: Option<Arc<dyn JobQueue>>,
    credentials: Arc<dyn CredentialProvider>,
}

fn build_runtime(config: &Config) -> anyhow::Result<Runtime> {
    let db = Database::open(&config.database.path)
        .with_context(|| format!("opening database at {}", config.database.path))?;
    let store = Arc::new(SqliteDocumentStore::new(db.clone()));
    let signer = Arc::new(SigningServiceClient::new(config.signer.clone())?);
    let authority = Arc::new(MhClient::new(config.authority.clone())?);

    let settings = EngineSettings::from_config(config)?;
    let mut engine = TransmissionEngine::new(store, signer, authority, settings);
    let queue: Option<Arc<dyn JobQueue>> = if config.queue.enabled {
        Some(Arc::new(SqliteJobQueue::new(db)))
    } else {
        None
    };
    if let Some(queue) = &queue {
        engine = engine.with_queue(queue.clone());
    }

    Ok(Runtime {
        engine: Arc::new(engine),
        queue,
        credentials: Arc::new(StaticCredentials::new(config.credentials.clone())),
    })
}

async fn resolve_credentials(
    runtime: &Runtime,
    auth: &AuthArgs,
    environment: Environment,
) -> anyhow::Result<AuthorityCredentials> {
    let secret = match &auth.secret {
        Some(secret) => secret.clone(),
        None => runtime
            .credentials
            .secret_for(&auth.tenant, &auth.identity)
            .await
            .ok_or_else(|| anyhow!("no secret configured for identity {}", auth.identity))?,
    };
    Ok(AuthorityCredentials::new(auth.identity.clone(), secret, environment))
}

fn worker_for(runtime: &Runtime, config: &Config) -> anyhow::Result<TransmissionWorker> {
    let queue = runtime
        .queue
        .clone()
        .ok_or_else(|| anyhow!("the queue is disabled in configuration"))?;
    Ok(TransmissionWorker::new(
        runtime.engine.clone(),
        queue,
        runtime.credentials.clone(),
        WorkerSettings::from_config(&config.queue),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let _log_guard = logging::init_logging(&config.logging);
    if let Some(addr) = &config.metrics.bind {
        metrics::init_metrics(addr);
    }

    let runtime = build_runtime(&config)?;

    match cli.command {
        Commands::Serve { bind, no_worker } => {
            let (stop_tx, stop_rx) = watch::channel(false);
            let worker = if no_worker || runtime.queue.is_none() {
                None
            } else {
                let worker = Arc::new(worker_for(&runtime, &config)?);
                Some(tokio::spawn(worker.run(stop_rx)))
            };

            let ctx = ApiContext {
                engine: runtime.engine.clone(),
                credentials: runtime.credentials.clone(),
            };
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            tokio::select! {
                res = start_server(ctx, &bind) => res?,
                _ = shutdown_signal() => info!("Shutdown requested"),
            }

            let _ = stop_tx.send(true);
            if let Some(handle) = worker {
                if let Err(e) = handle.await {
                    warn!("Worker task ended abnormally: {}", e);
                }
            }
        }
        Commands::Worker { once } => {
            let worker = Arc::new(worker_for(&runtime, &config)?);
            if once {
                let processed = worker.run_due(chrono::Utc::now()).await?;
                println!("Processed {} job(s)", processed);
            } else {
                let (stop_tx, stop_rx) = watch::channel(false);
                let handle = tokio::spawn(worker.run(stop_rx));
                shutdown_signal().await;
                info!("Shutdown requested; waiting for running jobs");
                let _ = stop_tx.send(true);
                handle.await?;
            }
        }
        Commands::Create {
            document_type,
            environment,
            file,
            control_number,
            establishment,
        } => {
            let document_type = DocumentType::from_code(&document_type)
                .ok_or_else(|| anyhow!("unknown document type '{}'", document_type))?;
            let environment: Environment = environment.parse().map_err(|e: String| anyhow!(e))?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let content: serde_json::Value = serde_json::from_str(&raw)?;
            let doc = runtime
                .engine
                .create_document(NewDocument {
                    document_type,
                    environment,
                    content,
                    control_number,
                    establishment,
                })
                .await?;
            print_json(&doc)?;
        }
        Commands::Transmit { id, auth, queued } => {
            let doc = runtime.engine.get_document(id).await?;
            let credentials = resolve_credentials(&runtime, &auth, doc.environment).await?;
            if queued {
                let submission = runtime
                    .engine
                    .transmit_async(id, &auth.tenant, &credentials)
                    .await?;
                print_json(&submission)?;
            } else {
                let result = runtime.engine.transmit_sync(id, &credentials).await?;
                print_json(&result)?;
            }
        }
        Commands::Annul { id, reason, auth } => {
            let doc = runtime.engine.get_document(id).await?;
            let credentials = resolve_credentials(&runtime, &auth, doc.environment).await?;
            print_json(&runtime.engine.annul(id, &reason, &credentials).await?)?;
        }
        Commands::Reopen { id, note } => {
            print_json(&runtime.engine.reopen_rejected(id, &note).await?)?;
        }
        Commands::Query {
            generation_code,
            environment,
            auth,
        } => {
            let environment: Environment = environment.parse().map_err(|e: String| anyhow!(e))?;
            let credentials = resolve_credentials(&runtime, &auth, environment).await?;
            print_json(
                &runtime
                    .engine
                    .query_status(&generation_code, &credentials)
                    .await?,
            )?;
        }
        Commands::Job { id } => print_json(&runtime.engine.job_status(id).await?)?,
        Commands::Events { id } => print_json(&runtime.engine.events(id).await?)?,
        Commands::Purge { id } => {
            runtime.engine.purge_document(id).await?;
            println!("Purged {}", id);
        }
    }
    Ok(())
}
