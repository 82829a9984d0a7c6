//! # Gateway Application
//!
//! Binary that wires together all the components:
//! - Load configuration (environment or `GATEWAY_CONFIG_FILE`)
//! - Initialize the repository adapter
//! - Start the outbox dispatcher, settlement workers and reconciliation loop
//! - Start the HTTP server and shut everything down on Ctrl+C/SIGTERM
//!
//! The `reconcile` and `correct` subcommands run one operator action against
//! the configured database and exit.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use opentelemetry::global;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace as sdktrace};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_engine::{
    Backoff, GatewayConfig, IdempotencyGuard, InMemoryBroker, Ledger, OutboxDispatcher,
    PaymentEngine, ReconciliationJob, SettlementConsumer, TracingAlertSink,
    TransactionStateMachine,
    inbound::{HttpServer, shutdown_signal},
    spawn_workers,
};
use gateway_repo::{Repo, build_repo};
use gateway_types::{
    AccountId, AlertSink, Currency, Money, ProcessorReportSource, SettlementProcessor,
    TransactionId,
};
use settlement_processor::{
    FileReportSource, HttpReportSource, HttpSettlementProcessor, SimulatedProcessor,
    StaticReportSource,
};

/// Deliveries buffered per broker partition.
const BROKER_CAPACITY: usize = 1024;
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "gateway")]
#[command(author, version, about = "Transaction processing and ledger engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and all background workers (default)
    Serve,
    /// Reconcile the ledger once against a processor report and print the result
    Reconcile {
        /// Settled-balance report exported by the processor (JSON)
        #[arg(long)]
        report: PathBuf,
    },
    /// Post a balanced ledger correction against an existing transaction
    Correct {
        /// Transaction the correction is recorded under
        #[arg(long)]
        transaction: TransactionId,
        /// Account debited by the correction
        #[arg(long)]
        debit: AccountId,
        /// Account credited by the correction
        #[arg(long)]
        credit: AccountId,
        /// Amount in minor units
        #[arg(long)]
        amount: i64,
        #[arg(long, default_value = "USD")]
        currency: Currency,
    },
}

fn init_tracer() -> anyhow::Result<Option<(sdktrace::Tracer, sdktrace::SdkTracerProvider)>> {
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_err() {
        return Ok(None);
    }
    global::set_text_map_propagator(TraceContextPropagator::new());

    // Use gRPC exporter with batch processing (non-blocking)
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;

    let provider = sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();

    global::set_tracer_provider(provider.clone());

    use opentelemetry::trace::TracerProvider as _;
    Ok(Some((provider.tracer("gateway"), provider)))
}

fn init_tracing() -> anyhow::Result<Option<sdktrace::SdkTracerProvider>> {
    let (telemetry, provider) = match init_tracer()? {
        Some((tracer, provider)) => (
            Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Some(provider),
        ),
        None => (None, None),
    };
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gateway_app=debug,gateway_engine=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(telemetry)
        .init();

    Ok(provider)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let otel_provider = init_tracing()?;
    let cli = Cli::parse();
    let config = config::load()?;

    let code = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            serve(config).await?;
            ExitCode::SUCCESS
        }
        Commands::Reconcile { report } => reconcile(config, report).await?,
        Commands::Correct {
            transaction,
            debit,
            credit,
            amount,
            currency,
        } => {
            let amount = Money::positive(amount, currency)?;
            correct(config, transaction, debit, credit, amount).await?;
            ExitCode::SUCCESS
        }
    };

    // Ensure traces are flushed before exit
    if let Some(provider) = otel_provider {
        let _ = provider.shutdown();
    }
    Ok(code)
}

async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!(
        port = config.server.port,
        backend = Repo::backend(),
        workers = config.settlement.workers,
        "Starting gateway"
    );

    // Build repository (handles connection and migration)
    let repo = Arc::new(build_repo(&config.database.url).await?);
    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
    let db_timeout = config.database.timeout;
    let backoff = Backoff::new(config.retry.base_delay, config.retry.max_delay);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Outbox → broker
    let (broker, partitions) = InMemoryBroker::new(config.settlement.workers, BROKER_CAPACITY);
    let broker = Arc::new(broker);
    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&repo),
        Arc::clone(&broker),
        config.outbox.clone(),
        backoff,
        db_timeout,
    );
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { dispatcher.run(rx).await }));

    // Broker → processor
    let processor: Arc<dyn SettlementProcessor> = match &config.settlement.processor_url {
        Some(url) => Arc::new(HttpSettlementProcessor::new(url, config.settlement.timeout)),
        None => {
            tracing::warn!("SETTLEMENT_PROCESSOR_URL not set, using simulated processor");
            Arc::new(SimulatedProcessor::new())
        }
    };
    let consumer = Arc::new(SettlementConsumer::new(
        Arc::clone(&repo),
        TransactionStateMachine::new(
            Arc::clone(&repo),
            Arc::clone(&alerts),
            db_timeout,
            config.settlement.auto_capture,
        ),
        processor,
        Arc::clone(&alerts),
        config.settlement.clone(),
        backoff,
        db_timeout,
    ));
    tasks.extend(spawn_workers(
        consumer,
        Arc::clone(&broker),
        partitions,
        shutdown_rx.clone(),
    ));

    // Reconciliation
    let reports: Arc<dyn ProcessorReportSource> = match &config.reconciliation.report_url {
        Some(url) => Arc::new(HttpReportSource::new(url, config.settlement.timeout)),
        None => {
            tracing::warn!("PROCESSOR_REPORT_URL not set, reconciling internal checks only");
            Arc::new(StaticReportSource::default())
        }
    };
    let job = ReconciliationJob::new(
        Arc::clone(&repo),
        reports,
        Arc::clone(&alerts),
        config.reconciliation.clone(),
        db_timeout,
    );
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { job.run(rx).await }));

    // Expired idempotency keys
    let guard = IdempotencyGuard::new(Arc::clone(&repo), config.idempotency.clone(), db_timeout);
    let mut rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = guard.purge_expired().await {
                        tracing::warn!(kind = err.kind(), "Idempotency purge failed");
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    // Create and run the HTTP server
    let engine = PaymentEngine::new(repo, &config, alerts);
    let server = HttpServer::new(engine);
    let addr = format!("0.0.0.0:{}", config.server.port);
    let result = server.run(&addr, shutdown_signal()).await;

    // Stop background loops once the server has drained
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "Background task ended abnormally");
        }
    }
    tracing::info!(
        undelivered = broker.pending_count(),
        "Gateway stopped"
    );
    result
}

async fn reconcile(config: GatewayConfig, report: PathBuf) -> anyhow::Result<ExitCode> {
    let repo = Arc::new(build_repo(&config.database.url).await?);
    let job = ReconciliationJob::new(
        repo,
        Arc::new(FileReportSource::new(report)),
        Arc::new(TracingAlertSink),
        config.reconciliation.clone(),
        config.database.timeout,
    );

    let report = job.run_once(chrono::Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn correct(
    config: GatewayConfig,
    transaction: TransactionId,
    debit: AccountId,
    credit: AccountId,
    amount: Money,
) -> anyhow::Result<()> {
    let repo = Arc::new(build_repo(&config.database.url).await?);
    let ledger = Ledger::new(repo, Arc::new(TracingAlertSink), config.database.timeout);

    let entries = ledger
        .post_transfer_correction(transaction, debit, credit, amount)
        .await?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_arguments_parse() {
        let cli = Cli::try_parse_from([
            "gateway",
            "correct",
            "--transaction",
            "00000000-0000-4000-8000-000000000000",
            "--debit",
            "acct-0042",
            "--credit",
            "acct-0001",
            "--amount",
            "100",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Correct {
                debit,
                amount,
                currency,
                ..
            }) => {
                assert_eq!(debit.expose(), "acct-0042");
                assert_eq!(amount, 100);
                assert_eq!(currency, Currency::USD);
            }
            _ => panic!("expected the correct subcommand"),
        }
    }

    #[test]
    fn test_correct_rejects_malformed_transaction_id() {
        let result = Cli::try_parse_from([
            "gateway",
            "correct",
            "--transaction",
            "not-a-uuid",
            "--debit",
            "a",
            "--credit",
            "b",
            "--amount",
            "1",
        ]);
        assert!(result.is_err());
    }
}
