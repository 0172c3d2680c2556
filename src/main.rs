//! postgen: news ingestion, post generation and channel publishing.
//! `serve` runs the scheduler, worker pool and operator HTTP surface;
//! the other subcommands are one-shot operator tools.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use channel_postgen::api::{self, AppState};
use channel_postgen::metrics::Metrics;
use channel_postgen::models::{NewSource, NewsSourceUpdate, ParserKind};
use channel_postgen::tasks::scheduler::{schedule_from_config, spawn_scheduler};
use channel_postgen::transport::gateway::GatewayConnector;
use channel_postgen::transport::session::SessionCredential;
use channel_postgen::transport::TransportConnector;
use channel_postgen::{Pipeline, PipelineConfig, Store, WorkerPool};

#[derive(Parser)]
#[command(name = "postgen", version, about)]
struct Cli {
    /// Config file (TOML or JSON). Defaults to config/postgen.{toml,json}.
    #[arg(long, global = true, env = "POSTGEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduler + workers + HTTP surface until Ctrl-C.
    Serve {
        /// Overrides server.bind
        #[arg(long)]
        bind: Option<String>,
        /// Do not start the interval loops (manual triggers only).
        #[arg(long)]
        no_schedule: bool,
    },
    /// Run one task to completion and print its JSON result.
    Run {
        /// ingest_feeds | ingest_channels | generate_posts | publish_drafts | retry_failed
        task: String,
        /// JSON arguments, e.g. '{"limit": 3}'
        #[arg(long)]
        args: Option<String>,
    },
    /// Print news/post counters.
    Stats,
    /// Store the messaging-gateway session credential used by the pipeline.
    ProvisionSession {
        #[arg(long, env = "CHANNEL_ACCOUNT")]
        account: String,
        #[arg(long, env = "CHANNEL_GATEWAY_URL")]
        gateway_url: String,
        #[arg(long, env = "CHANNEL_SESSION_TOKEN", hide_env_values = true)]
        session_token: String,
        /// Write without checking the session against the gateway.
        #[arg(long)]
        skip_check: bool,
    },
    /// Insert configured sources that are not in the database yet.
    SeedSources,
    /// Inspect or change news sources.
    Sources {
        #[command(subcommand)]
        action: SourcesCommand,
    },
}

#[derive(Subcommand)]
enum SourcesCommand {
    List,
    /// Flip (or set with --active) a source's active flag.
    Toggle {
        id: i64,
        #[arg(long)]
        active: Option<bool>,
    },
    Add {
        name: String,
        url: String,
        /// feed | channel
        #[arg(long, default_value = "feed")]
        parser: ParserKind,
        #[arg(long)]
        inactive: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("channel_postgen=info,postgen=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let cfg = match path {
        Some(p) => {
            let mut cfg = PipelineConfig::load_from(p)?;
            cfg.apply_env_overrides();
            cfg
        }
        None => PipelineConfig::load_default()?,
    };
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { bind, no_schedule } => serve(cfg, bind, no_schedule).await,
        Command::Run { task, args } => run_task(cfg, &task, args.as_deref()).await,
        Command::Stats => {
            let store = Store::connect(&cfg.database.url, 1).await?;
            print_json(&store.stats().await?)
        }
        Command::ProvisionSession {
            account,
            gateway_url,
            session_token,
            skip_check,
        } => provision_session(&cfg, account, gateway_url, session_token, skip_check).await,
        Command::SeedSources => {
            let store = Store::connect(&cfg.database.url, 1).await?;
            let added = store.seed_sources(&cfg.sources).await?;
            println!("seeded {added} new source(s)");
            Ok(())
        }
        Command::Sources { action } => sources(&cfg, action).await,
    }
}

async fn serve(cfg: PipelineConfig, bind: Option<String>, no_schedule: bool) -> Result<()> {
    let metrics = Metrics::init()?;
    let pipeline = Arc::new(Pipeline::from_config(&cfg).await?);
    let seeded = pipeline.store.seed_sources(&cfg.sources).await?;
    if seeded > 0 {
        tracing::info!(seeded, "default sources added");
    }

    let pool = Arc::new(WorkerPool::start(pipeline.registry(), cfg.server.workers));
    let schedulers = if no_schedule {
        Vec::new()
    } else {
        spawn_scheduler(pool.clone(), schedule_from_config(&cfg.schedule))
    };

    let state = AppState {
        store: pipeline.store.clone(),
        pool: pool.clone(),
    };
    let app = api::router(state, &metrics);
    let addr = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "operator surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server")?;

    for h in schedulers {
        h.abort();
        let _ = h.await;
    }
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown().await,
        Err(_) => tracing::warn!("worker pool still referenced; not draining"),
    }
    Ok(())
}

async fn run_task(cfg: PipelineConfig, task: &str, args: Option<&str>) -> Result<()> {
    let args: Value = match args {
        Some(s) => serde_json::from_str(s).context("--args must be JSON")?,
        None => Value::Null,
    };
    let pipeline = Arc::new(Pipeline::from_config(&cfg).await?);
    let pool = WorkerPool::start(pipeline.registry(), 1);
    let out = pool.dispatch(task, args).await?.wait().await;
    pool.shutdown().await;
    print_json(&out?)
}

async fn provision_session(
    cfg: &PipelineConfig,
    account: String,
    gateway_url: String,
    session_token: String,
    skip_check: bool,
) -> Result<()> {
    let path = cfg.transport.session_path.clone();
    let cred = SessionCredential::new(account, gateway_url, session_token)?;
    cred.save(&path)?;

    if !skip_check {
        let connector =
            GatewayConnector::new(path.clone()).with_timeout(cfg.transport.request_timeout_secs);
        match connector.connect().await {
            Ok(mut session) => session.close().await,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(anyhow::Error::new(e).context("session check failed; credential not stored"));
            }
        }
    }
    println!(
        "session for {} stored at {} (token {})",
        cred.account,
        path.display(),
        cred.redacted_token()
    );
    Ok(())
}

async fn sources(cfg: &PipelineConfig, action: SourcesCommand) -> Result<()> {
    let store = Store::connect(&cfg.database.url, 1).await?;
    match action {
        SourcesCommand::List => print_json(&store.list_sources().await?),
        SourcesCommand::Toggle { id, active } => {
            let current = store
                .get_source(id)
                .await?
                .ok_or_else(|| anyhow!("no source with id {id}"))?;
            let update = NewsSourceUpdate {
                is_active: Some(active.unwrap_or(!current.is_active)),
                ..NewsSourceUpdate::default()
            };
            let updated = store
                .update_source(id, &update)
                .await?
                .ok_or_else(|| anyhow!("no source with id {id}"))?;
            print_json(&updated)
        }
        SourcesCommand::Add {
            name,
            url,
            parser,
            inactive,
        } => {
            let src = store
                .create_source(&NewSource {
                    name,
                    url,
                    is_active: !inactive,
                    parser,
                })
                .await?;
            print_json(&src)
        }
    }
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
