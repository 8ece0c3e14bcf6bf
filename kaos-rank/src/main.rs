//! kaos-rank daemon: runs the finalize poll, snapshot sweep and award worker.

use clap::Parser;
use kaos_rank::{
    init_tracing, Engine, Idempotent, LoggingProcessor, ProcessorRegistry, RankConfig,
    TracingConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "kaos-rank", version, about = "Ranked leaderboard engine")]
struct Args {
    /// JSON config file. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// PostgreSQL URL for durable and schedule storage.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL for the live score store.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    json_logs: bool,

    /// OTLP collector endpoint (requires the `telemetry` feature).
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut tracing_config = TracingConfig::new("kaos-rank").with_level(&args.log_level);
    if args.json_logs {
        tracing_config = tracing_config.with_json();
    }
    if let Some(endpoint) = &args.otlp_endpoint {
        tracing_config = tracing_config.with_otlp(endpoint);
    }
    let _guard = init_tracing(tracing_config)?;

    let config = match &args.config {
        Some(path) => RankConfig::from_file(path)?,
        None => RankConfig::default(),
    };

    let registry = ProcessorRegistry::new().with_all(Arc::new(Idempotent::new(LoggingProcessor)));
    let builder = Engine::builder()
        .with_config(config)
        .with_processors(registry);

    #[cfg(feature = "postgres")]
    let builder = match &args.database_url {
        Some(url) => {
            let store = Arc::new(kaos_rank::PostgresStore::new(url).await?);
            store.migrate().await?;
            info!("Using PostgreSQL storage");
            builder
                .with_durable_store(store.clone())
                .with_schedule_store(store)
        }
        None => builder,
    };
    #[cfg(not(feature = "postgres"))]
    let builder = {
        if args.database_url.is_some() {
            warn!("DATABASE_URL ignored: built without the postgres feature");
        }
        builder
    };

    #[cfg(feature = "redis")]
    let builder = match &args.redis_url {
        Some(url) => {
            info!("Using Redis live store");
            builder.with_live_store(Arc::new(kaos_rank::RedisLiveStore::new(url)?))
        }
        None => builder,
    };
    #[cfg(not(feature = "redis"))]
    let builder = {
        if args.redis_url.is_some() {
            warn!("REDIS_URL ignored: built without the redis feature");
        }
        builder
    };

    #[cfg(feature = "metrics")]
    let builder = builder.with_metrics(Arc::new(kaos_rank::Metrics::new()));

    let engine = builder.build()?;
    info!("kaos-rank running, press Ctrl+C to stop");
    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    Ok(())
}
