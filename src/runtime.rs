use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::telegram::TelegramApi;
use crate::web::{start_web_server, WebState};
use relaygram_channels::chat_api::ChatApi;
use relaygram_channels::registration::ensure_webhook;
use relaygram_core::error::RelayError;
use relaygram_storage::db::Database;

/// Opens the store, points the platform webhook at this process and serves
/// HTTP until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let db = Arc::new(Database::new(&config.storage_path)?);
    info!(storage_path = %config.storage_path, "Token store opened");

    let api: Arc<dyn ChatApi> = Arc::new(TelegramApi::new(&config.telegram_bot_token));
    if config.skip_webhook_setup {
        warn!("Webhook setup skipped by configuration");
    } else {
        if config.secret_generated {
            info!("Webhook secret generated for this run, forcing re-registration");
        }
        ensure_webhook(
            api.as_ref(),
            &config.webhook_url,
            config.webhook_secret(),
            config.secret_generated,
        )
        .await
        .map_err(|e| RelayError::Platform(format!("Webhook registration failed: {e}")))?;
    }

    let state = WebState::new(&config, db, api);
    start_web_server(state, &config.bind_addr(), shutdown_signal()).await?;
    Ok(())
}

pub struct CheckReport {
    pub active_tokens: i64,
    pub webhook_url: Option<String>,
    pub webhook_matches: bool,
}

/// Validates that the store opens and asks the platform which webhook URL it
/// currently delivers to. Nothing is modified.
pub async fn check(config: &Config) -> anyhow::Result<CheckReport> {
    let db = Database::new(&config.storage_path)?;
    let active_tokens = db.count_active()?;
    let api = TelegramApi::new(&config.telegram_bot_token);
    let webhook_url = api
        .webhook_url()
        .await
        .map_err(|e| RelayError::Platform(format!("Failed to query webhook info: {e}")))?;
    let webhook_matches = webhook_url.as_deref() == Some(config.webhook_url.as_str());
    Ok(CheckReport {
        active_tokens,
        webhook_url,
        webhook_matches,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
