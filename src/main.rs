use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fuel_coordinator::agent::Scheduler;
use fuel_coordinator::config::{CoordinatorConfig, LoggingConfig};
use fuel_coordinator::ingest::{EtaExtractor, IngestPipeline, spawn_email_poller};
use fuel_coordinator::llm::create_provider;
use fuel_coordinator::mail::{EmailSender, ImapMailbox, LogOnlySender, Mailbox, SmtpSender};
use fuel_coordinator::pipeline::{Advisor, HeuristicAdvisor, LlmAdvisor};
use fuel_coordinator::store::{Database, LibSqlBackend};
use fuel_coordinator::{Coordinator, api};

/// How long shutdown waits for the poller and for in-flight runs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_logging(&LoggingConfig::from_env())?;
    let config = CoordinatorConfig::from_env();

    eprintln!("⛽ Fuel Coordinator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database.path.display());
    eprintln!("   API: http://{}", config.api.bind_addr);

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database.path)
            .await
            .with_context(|| format!("opening database at {}", config.database.path.display()))?,
    );

    // ── Model tiers ──────────────────────────────────────────────────────
    let llm = match &config.llm {
        Some(llm_config) => match create_provider(llm_config) {
            Ok(provider) => Some((provider, llm_config.timeout)),
            Err(e) => {
                warn!("LLM provider unavailable, using deterministic tiers only: {e}");
                None
            }
        },
        None => {
            info!("No LLM API key configured, using deterministic tiers only");
            None
        }
    };
    let advisor: Arc<dyn Advisor> = match &llm {
        Some((provider, timeout)) => Arc::new(LlmAdvisor::new(Arc::clone(provider), *timeout)),
        None => Arc::new(HeuristicAdvisor),
    };
    let extractor = match &llm {
        Some((provider, timeout)) => EtaExtractor::new(Some(Arc::clone(provider)), *timeout),
        None => EtaExtractor::patterns_only(),
    };

    // ── Outbound mail ────────────────────────────────────────────────────
    let sender: Arc<dyn EmailSender> = match &config.mail {
        Some(mail_config) => match SmtpSender::new(mail_config) {
            Ok(sender) => Arc::new(sender),
            Err(e) => {
                warn!("SMTP unavailable, ETA requests will only be logged: {e}");
                Arc::new(LogOnlySender)
            }
        },
        None => Arc::new(LogOnlySender),
    };

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&store),
        &config,
        advisor,
        sender,
    ));

    // ── Background tasks ─────────────────────────────────────────────────
    let poller = config.mail.clone().map(|mail_config| {
        let interval = mail_config.poll_interval;
        let mailbox: Arc<dyn Mailbox> = Arc::new(ImapMailbox::new(mail_config));
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&store),
            mailbox,
            extractor,
            coordinator.knowledge().clone(),
        ));
        spawn_email_poller(pipeline, interval)
    });
    if poller.is_none() {
        info!("EMAIL_IMAP_HOST not set, carrier replies will not be polled");
    }

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        coordinator.runner(),
        config.scheduler.clone(),
    ));
    let scheduler_handle = scheduler.start().await.context("starting scheduler")?;

    // ── API ──────────────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&coordinator));
    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.api.bind_addr))?;
    info!(addr = %config.api.bind_addr, "API listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
    });
    if let Err(e) = server.await {
        error!("API server error: {e}");
    }

    info!("Shutting down");
    scheduler_handle.shutdown();
    if let Some(poller) = poller {
        poller.stop(SHUTDOWN_GRACE).await;
    }
    let runner = coordinator.runner();
    if !runner.drain(SHUTDOWN_GRACE).await {
        warn!(
            in_flight = runner.in_flight(),
            "Runs still in flight at exit; the watchdog will time them out on restart"
        );
    }
    Ok(())
}

/// Console logging, plus a daily rolling file when a log directory is configured.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fuel-coordinator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(guard)
}
