//! Graceful handoff server.
//!
//! # Architecture Overview
//!
//! ```text
//!   SIGHUP ──────────┐                 ┌──────────── successor (same binary)
//!   SIGTERM/SIGINT ──┤                 │  fd 3 listener, fd 4 handshake
//!                    ▼                 │
//!             ┌─────────────┐   launch │   "ready\n"
//!             │ coordinator │──────────┴──────────────┐
//!             └──────┬──────┘                         │
//!                    │ Ready / Shutdown               ▼
//!                    ▼                          handshake read
//!             ┌─────────────┐
//!             │    drain    │── stop accept ─▶ wait for work ─▶ exit 0
//!             └─────────────┘
//! ```

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use graceful_handoff::cli::Cli;
use graceful_handoff::http::{router, HttpServer, Workload};
use graceful_handoff::lifecycle::startup::{
    acquire_exit_code, announce_ready, EXIT_INVALID_INHERITANCE, EXIT_STARTUP_FAILURE,
};
use graceful_handoff::lifecycle::{
    event_queue, install_os_signals, CommandLauncher, Coordinator, DrainPolicy, ProcessIdentity,
    ProcessRole, ReadyNotifier,
};
use graceful_handoff::lifecycle::signals::EVENT_QUEUE_CAPACITY;
use graceful_handoff::net::{acquire, ConnectionTracker};
use graceful_handoff::observability::{logging, metrics};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init_logging(logging::DEFAULT_FILTER);
            tracing::error!(error = %e, "Invalid configuration");
            process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    logging::init_logging(&config.observability.log_filter);

    let mode = match cli.startup_mode(&config) {
        Ok(mode) => mode,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    let identity = ProcessIdentity::new(mode.role());

    tracing::info!(
        pid = identity.pid(),
        instance = %identity.instance(),
        role = %identity.role(),
        version = env!("CARGO_PKG_VERSION"),
        "graceful-handoff starting"
    );

    let mut notifier = match mode.ready_notifier() {
        Ok(notifier) => notifier,
        Err(e) => {
            tracing::error!(pid = identity.pid(), error = %e, "Unusable inherited handshake");
            process::exit(EXIT_INVALID_INHERITANCE);
        }
    };

    let listener = match acquire(mode.acquire_mode()).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(pid = identity.pid(), error = %e, "Failed to acquire listener");
            process::exit(acquire_exit_code(&e));
        }
    };

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            match identity.role() {
                ProcessRole::Successor => {
                    tokio::spawn(metrics::init_metrics_with_retry(
                        addr,
                        metrics::EXPORTER_RETRY_INTERVAL,
                        metrics::EXPORTER_RETRY_ATTEMPTS,
                    ));
                }
                ProcessRole::Fresh | ProcessRole::Activated => {
                    metrics::init_metrics(addr);
                }
            }
        }
    }

    // Handlers must be in place before a predecessor can hand over.
    let (events, event_rx) = event_queue(EVENT_QUEUE_CAPACITY);
    if let Err(e) = install_os_signals(events) {
        tracing::error!(error = %e, "Failed to install signal handlers");
        process::exit(EXIT_STARTUP_FAILURE);
    }

    let launcher = match CommandLauncher::for_current_process(config.restart.successor_binary.as_deref()) {
        Ok(launcher) => launcher,
        Err(e) => {
            tracing::error!(error = %e, "Cannot resolve successor executable");
            process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    tracing::debug!(successor_binary = %launcher.program().display(), "Upgrades will launch");

    let tracker = ConnectionTracker::new();
    let app = router(
        identity.clone(),
        Workload::from(&config.workload),
        tracker.clone(),
        Duration::from_secs(config.timeouts.request_secs),
    );
    let serving = HttpServer::new(
        app,
        tracker.clone(),
        config.listener.max_connections,
        identity.clone(),
    )
    .first_request_grace(Duration::from_millis(config.drain.first_request_grace_ms))
    .start(listener);

    if let Some(notifier) = notifier.as_mut() {
        announce_ready(notifier as &mut dyn ReadyNotifier, &identity);
    }

    let coordinator = Coordinator::new(
        identity.clone(),
        serving,
        tracker,
        Arc::new(launcher),
        Duration::from_secs(config.restart.handshake_timeout_secs),
        DrainPolicy::from(&config.drain),
    );
    let report = coordinator.run(event_rx).await;

    tracing::info!(
        pid = identity.pid(),
        instance = %identity.instance(),
        reason = %report.reason,
        outcome = report.outcome.as_str(),
        "Shutdown complete"
    );
    process::exit(report.exit_code());
}
