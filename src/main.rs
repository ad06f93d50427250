use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_triage::config::TriageConfig;
use mail_triage::gateway::{GatewayRegistry, GmailGateway, OutlookGateway};
use mail_triage::llm::{LlmProvider, RetryingProvider, create_provider};
use mail_triage::pipeline::{
    Classifier, FetchAndDispatch, PipelineContext, PipelineStats, ReplyHandler,
};
use mail_triage::queue::store::spawn_prune_task;
use mail_triage::queue::trigger::parse_schedule;
use mail_triage::queue::{
    JobQueue, LibSqlQueue, Trigger, TypedQueue, WorkerPool, spawn_cron_trigger,
};

/// Finished jobs older than this are pruned from the queue table.
const PRUNE_KEEP: Duration = Duration::from_secs(7 * 24 * 3600);

/// How long in-flight jobs get to finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TriageConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 mail-triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Queue: {}", config.db_path.display());
    eprintln!("   Schedule: {}", config.schedule);
    eprintln!(
        "   Mailboxes: {}\n",
        if config.mailboxes.is_empty() {
            "none".to_string()
        } else {
            config
                .mailboxes
                .iter()
                .map(|m| m.provider.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );

    let store = Arc::new(
        LibSqlQueue::new_local(&config.db_path)
            .await
            .context("Failed to open job queue")?,
    );
    let queue: Arc<dyn JobQueue> = store.clone();

    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;
    let llm: Arc<dyn LlmProvider> = Arc::new(RetryingProvider::new(
        llm,
        config.llm_retry.clone(),
        config.llm_timeout,
    ));

    let gateways = GatewayRegistry::new()
        .with(Arc::new(GmailGateway::new(
            config.gateway_timeout,
            config.list_limit,
        )?))
        .with(Arc::new(OutlookGateway::new(
            config.gateway_timeout,
            config.list_limit,
        )?));

    let ctx = Arc::new(PipelineContext {
        gateways,
        classifier: Arc::new(Classifier::new(llm)),
        reply_queue: TypedQueue::new(Arc::clone(&queue)),
        stats: Arc::new(PipelineStats::new()),
        settings: config.pipeline.clone(),
    });

    let process_pool = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        Arc::new(FetchAndDispatch::new(Arc::clone(&ctx))),
        config.process_pool.clone(),
    ));
    let reply_pool = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        Arc::new(ReplyHandler::new(Arc::clone(&ctx))),
        config.reply_pool.clone(),
    ));
    let (process_handle, process_stop) = process_pool.spawn();
    let (reply_handle, reply_stop) = reply_pool.spawn();

    if config.mailboxes.is_empty() {
        warn!("No mailbox tokens configured; only externally enqueued jobs will run");
    }
    let trigger = Trigger::new(TypedQueue::new(Arc::clone(&queue)));
    let (trigger_handle, trigger_stop) = spawn_cron_trigger(
        parse_schedule(&config.schedule)?,
        config.mailboxes.clone(),
        trigger,
    );
    let prune_handle = spawn_prune_task(Arc::clone(&store), PRUNE_KEEP);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    for flag in [&trigger_stop, &process_stop, &reply_stop] {
        flag.store(true, Ordering::Relaxed);
    }
    trigger_handle.abort();
    prune_handle.abort();

    let drain = futures::future::join(process_handle, reply_handle);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Workers still busy after grace period; leased jobs will be redelivered");
    }

    let stats = ctx.stats.snapshot();
    info!(
        processed = stats.processed,
        labeled = stats.labeled,
        replied = stats.replied,
        reply_enqueued = stats.reply_enqueued,
        skipped = stats.skipped,
        failures = stats.total_failures(),
        "mail-triage stopped"
    );
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when a log directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}
