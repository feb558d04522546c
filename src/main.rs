//! stockdata - A-share market data platform backend.
//!
//! One process hosts the ingestion scheduler (plugins, rate governor,
//! execution store) and the strategy arena engine, fronted by the axum API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockdata_backend::api::{router, AppState};
use stockdata_backend::arena::competition::CompetitionEngine;
use stockdata_backend::arena::llm::{LlmClient, OpenAiCompatClient};
use stockdata_backend::arena::manager::{ArenaManager, EvaluatorPeriods};
use stockdata_backend::arena::repo::ArenaRepo;
use stockdata_backend::arena::stream::StreamProcessor;
use stockdata_backend::clock::{Clock, SystemClock};
use stockdata_backend::config::Config;
use stockdata_backend::plugins::builtin::builtin_plugins;
use stockdata_backend::plugins::PluginRegistry;
use stockdata_backend::provider::{HttpProvider, ProviderClient};
use stockdata_backend::scheduler::calendar::TradingCalendar;
use stockdata_backend::scheduler::missing::MissingDataDetector;
use stockdata_backend::scheduler::rate::RateGovernor;
use stockdata_backend::scheduler::{Scheduler, SchedulerConfig};
use stockdata_backend::store::execution::ExecutionStore;
use stockdata_backend::store::ods::OdsStore;
use stockdata_backend::store::schema_sync::SchemaSynchronizer;
use stockdata_backend::store::MetaDb;

#[derive(Debug, Parser)]
#[command(name = "stockdata", about = "A-share market data platform backend")]
struct Args {
    /// Listen port; overrides PORT from the environment.
    #[arg(long)]
    port: Option<u16>,
    /// Database path; overrides DATABASE_PATH from the environment.
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = args.db {
        config.database_path = db;
    }
    let config = Arc::new(config);

    info!(db = %config.database_path, "opening platform database");
    let db = MetaDb::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(
        PluginRegistry::discover(builtin_plugins(), db.clone())
            .context("plugin registry discovery")?,
    );
    info!(plugins = registry.list().len(), "plugin registry frozen");

    let governor = Arc::new(RateGovernor::new());
    let provider: Arc<dyn ProviderClient> = Arc::new(HttpProvider::new(
        config.provider_base_url.clone(),
        config.provider_token.clone(),
        Duration::from_secs(config.extract_timeout_secs),
    ));
    let executions = Arc::new(ExecutionStore::new(db.clone()));
    let ods = Arc::new(OdsStore::new(db.clone(), clock.clone()));
    let schema = Arc::new(SchemaSynchronizer::new(db.clone(), clock.clone()));
    let calendar = Arc::new(TradingCalendar::new(db.clone()));

    let scheduler = Scheduler::new(
        registry.clone(),
        governor,
        provider,
        executions.clone(),
        ods.clone(),
        schema,
        calendar.clone(),
        clock.clone(),
        SchedulerConfig {
            worker_concurrency: config.worker_concurrency,
            inner_concurrency_cap: config.inner_concurrency_cap,
            extract_timeout_secs: config.extract_timeout_secs,
            rate_limited_retry_budget: config.rate_limited_retry_budget,
            retention_days: config.retention_days,
            tz_offset_hours: config.tz_offset_hours,
        },
    );
    let recovered = scheduler
        .recover_interrupted()
        .context("recovering interrupted executions")?;
    if recovered > 0 {
        info!(recovered, "marked stale executions interrupted");
    }

    let shutdown = CancellationToken::new();
    let _cron = scheduler.spawn_cron(shutdown.clone());
    let _sweep = scheduler.spawn_retention_sweep(shutdown.clone());

    let repo = Arc::new(ArenaRepo::new(db.clone()));
    let stream = Arc::new(StreamProcessor::new(repo.clone(), clock.clone()));
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiCompatClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let competition = CompetitionEngine::new(ods.clone(), clock.clone());
    let arenas = ArenaManager::new(
        repo,
        stream,
        llm,
        competition,
        clock.clone(),
        EvaluatorPeriods {
            daily: Duration::from_secs(config.evaluator_daily_secs),
            weekly: Duration::from_secs(config.evaluator_weekly_secs),
            monthly: Duration::from_secs(config.evaluator_monthly_secs),
        },
    );
    let rehydrated = arenas.load_persisted().context("loading persisted arenas")?;
    if rehydrated > 0 {
        info!(rehydrated, "arenas rehydrated (paused)");
    }

    let missing = Arc::new(MissingDataDetector::new(
        registry.clone(),
        calendar,
        ods.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        registry,
        scheduler,
        executions,
        ods,
        missing,
        arenas,
        clock,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    Ok(())
}
