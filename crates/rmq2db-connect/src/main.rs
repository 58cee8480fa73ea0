//! rmq2db - RabbitMQ to PostgreSQL bridge
//!
//! # Usage
//!
//! ```bash
//! # Run the bridge (default)
//! rmq2db -c rmq2db.yaml
//!
//! # Validate configuration
//! rmq2db -c rmq2db.yaml validate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rmq2db_connect::amqp::AmqpConsumer;
use rmq2db_connect::{Bridge, BridgeConfig, HandlerRegistry, TransactionalWriter};
use rmq2db_rdbc::connection::ConnectionConfig;
use rmq2db_rdbc::postgres::PgConnectionFactory;

#[derive(Parser)]
#[command(name = "rmq2db")]
#[command(version, about = "Buffering RabbitMQ to PostgreSQL bridge")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rmq2db.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume and flush until interrupted (default)
    Run,
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = BridgeConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: BridgeConfig) -> Result<()> {
    info!("Starting rmq2db");

    if config.metrics.enabled {
        info!(address = %config.metrics.listen, "Starting metrics server");
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(config.metrics.listen)
            .install()
            .context("Failed to install Prometheus exporter")?;
    }

    let registry = Arc::new(
        HandlerRegistry::from_config(&config.handlers).context("Failed to build handlers")?,
    );

    let db_config = ConnectionConfig::new(config.database.url.expose_secret())
        .with_connect_timeout(config.database.connect_timeout())
        .with_application_name("rmq2db");
    let writer = TransactionalWriter::new(Arc::new(PgConnectionFactory), db_config);
    let bridge = Bridge::new(registry, writer, config.flush.settings());

    let consumer = AmqpConsumer::connect(&config.broker, config.flush.prefetch())
        .await
        .context("Failed to connect to broker")?;
    let messages = consumer.consume().await.context("Failed to start consumer")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = bridge.run(Box::pin(messages), shutdown).await;

    consumer.close().await;
    bridge.coordinator().close().await;

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Bridge stopped: {}", e);
            Err(e.into())
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received shutdown signal (Ctrl+C)"),
                    _ = term.recv() => info!("Received shutdown signal (SIGTERM)"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received shutdown signal (Ctrl+C)");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (Ctrl+C)");
    }
    shutdown.cancel();
}

fn validate_config(config: &BridgeConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Database:");
    println!("  URL: {}", config.database.url.redacted_url());
    println!("  Connect timeout: {}s", config.database.connect_timeout_secs);
    println!();

    println!("Broker:");
    println!("  URL: {}", config.broker.url.redacted_url());
    println!("  Queue: {}", config.broker.queue);
    println!("  Consumer tag: {}", config.broker.consumer_tag);
    println!("  Timestamp header: {}", config.broker.timestamp_header);
    println!();

    let settings = config.flush.settings();
    println!("Flush:");
    println!("  Count: {} (prefetch {})", settings.count, config.flush.prefetch());
    println!("  Max wait: {:?}", settings.max_wait);
    println!("  Retry backoff: {:?}", settings.retry_backoff);
    println!();

    println!("Handlers ({}):", config.handlers.len());
    for handler in &config.handlers {
        let target = handler.target();
        println!(
            "  {:<16} → {:<32} {}",
            handler.logical_key(),
            target.table_ref(),
            handler.strategy
        );
        println!("    keys:   [{}]", handler.key_fields.join(", "));
        println!("    values: [{}]", handler.value_fields.join(", "));
    }

    Ok(())
}
