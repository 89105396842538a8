use tracing::info;

use crate::chat_api::{ChatApi, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    AlreadyConfigured,
    Registered,
}

/// Points the platform's update push at `url`.
///
/// Registration is skipped when the platform already reports `url`, unless
/// `force` is set. Callers force it when the secret is new for this process,
/// since the platform cannot report which secret it holds.
pub async fn ensure_webhook(
    api: &dyn ChatApi,
    url: &str,
    secret: &str,
    force: bool,
) -> Result<WebhookStatus, SendError> {
    let current = api.webhook_url().await?;
    if !force && current.as_deref() == Some(url) {
        info!(url, "Webhook already configured");
        return Ok(WebhookStatus::AlreadyConfigured);
    }
    api.set_webhook(url, secret).await?;
    info!(url, previous = current.as_deref().unwrap_or("<none>"), "Webhook registered");
    Ok(WebhookStatus::Registered)
}
