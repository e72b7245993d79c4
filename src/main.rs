use std::sync::Arc;

use anyhow::Context;

use mail_sorter::config::DaemonConfig;
use mail_sorter::filter::FilterEngine;
use mail_sorter::logging;
use mail_sorter::mailbox::TlsDialer;
use mail_sorter::rules::JsonRuleStore;
use mail_sorter::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = DaemonConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = logging::init(config.log_file.as_deref())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        rules = %config.rules_file.display(),
        imap_port = config.imap_port,
        "Mail sorter starting"
    );

    let store = Arc::new(JsonRuleStore::new(config.rules_file.clone()));
    let dialer = Arc::new(TlsDialer::new(config.imap_port, config.io_timeout));
    let engine = FilterEngine::new(dialer, config.limits)
        .with_folder_validation(config.validate_folders);
    let scheduler = Arc::new(Scheduler::new(config.scheduler, store, Arc::new(engine)));

    let stop = scheduler.stop_handle();
    let runner = Arc::clone(&scheduler);
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut handle => {
            result.context("Scheduler task failed")?;
            return Ok(());
        }
        () = shutdown_signal() => {}
    }

    stop.stop();
    handle.await.context("Scheduler task failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Ctrl+C received, shutting down..."),
        () = terminate => tracing::info!("SIGTERM received, shutting down..."),
    }
}
