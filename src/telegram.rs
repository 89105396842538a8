use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::{ApiError, RequestError};

use relaygram_channels::chat_api::{ChatApi, Formatting, MessageRef, SendError, SendErrorKind};

/// Telegram Bot API behind the [`ChatApi`] seam.
pub struct TelegramApi {
    bot: Bot,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        TelegramApi {
            bot: Bot::new(bot_token),
        }
    }
}

/// Maps a platform error description ("Forbidden: bot was blocked by the
/// user", "Not Found", ...) onto a failure kind.
pub fn classify_description(description: &str) -> SendErrorKind {
    let lower = description.trim().to_ascii_lowercase();
    if lower.starts_with("forbidden") {
        SendErrorKind::Blocked
    } else if lower.starts_with("unauthorized") {
        SendErrorKind::Unauthorized
    } else if lower.starts_with("bad request") {
        SendErrorKind::BadRequest
    } else if lower.starts_with("too many requests") {
        SendErrorKind::RateLimited
    } else if lower == "not found" {
        SendErrorKind::BotNotFound
    } else if lower.starts_with("internal server error")
        || lower.starts_with("bad gateway")
        || lower.starts_with("gateway timeout")
        || lower.starts_with("service unavailable")
    {
        SendErrorKind::Server
    } else {
        SendErrorKind::Other
    }
}

fn classify_api_error(err: &ApiError) -> SendErrorKind {
    match err {
        ApiError::BotBlocked | ApiError::BotKicked | ApiError::UserDeactivated => {
            SendErrorKind::Blocked
        }
        ApiError::InvalidToken => SendErrorKind::Unauthorized,
        ApiError::Unknown(description) => classify_description(description),
        other => match classify_description(&other.to_string()) {
            SendErrorKind::Other => SendErrorKind::BadRequest,
            kind => kind,
        },
    }
}

pub fn classify_request_error(err: &RequestError) -> SendErrorKind {
    match err {
        RequestError::Api(api) => classify_api_error(api),
        RequestError::RetryAfter(_) => SendErrorKind::RateLimited,
        RequestError::Network(_) | RequestError::Io(_) => SendErrorKind::Network,
        RequestError::InvalidJson { .. } => SendErrorKind::MalformedResponse,
        _ => SendErrorKind::Other,
    }
}

fn send_error(err: RequestError) -> SendError {
    SendError::new(classify_request_error(&err), err.to_string())
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        formatting: Formatting,
    ) -> Result<MessageRef, SendError> {
        let req = self.bot.send_message(ChatId(chat_id), text);
        let req = match formatting {
            Formatting::Html => req.parse_mode(ParseMode::Html),
            Formatting::Plain => req,
        };
        let message = req.await.map_err(send_error)?;
        Ok(MessageRef {
            message_id: message.id.0,
            chat_id: message.chat.id.0,
        })
    }

    async fn webhook_url(&self) -> Result<Option<String>, SendError> {
        let info = self.bot.get_webhook_info().await.map_err(send_error)?;
        Ok(info.url.map(|url| url.to_string()))
    }

    async fn set_webhook(&self, url: &str, secret: &str) -> Result<(), SendError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| {
            SendError::new(SendErrorKind::BadRequest, format!("Invalid webhook URL '{url}': {e}"))
        })?;
        let mut req = self.bot.set_webhook(parsed);
        req.secret_token = Some(secret.to_string());
        req.await.map_err(send_error)?;
        Ok(())
    }
}
