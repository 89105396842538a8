//! Inbound updates pushed by the platform: `/start`, `/stop`, anything else.
//!
//! Every update is handled statelessly against the token store. Handling runs
//! on its own task and only ever reports a [`WebhookAction`]; store and
//! delivery failures are logged there and never reach the HTTP layer.

use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use relaygram_channels::chat_api::Formatting;
use relaygram_channels::dispatch::{Destination, Dispatcher};
use relaygram_core::error::RelayError;
use relaygram_core::token::mask_token;
use relaygram_storage::db::{call_blocking, Database, TokenKey, TokenRecord};

const DEFAULT_USER_NAME: &str = "User";

#[derive(Debug, Default, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chat: Option<IncomingChat>,
    #[serde(default)]
    pub from: Option<Sender>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IncomingChat {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub first_name: Option<String>,
}

impl Update {
    /// Reads an update from already-parsed JSON. A payload of the wrong shape
    /// becomes an empty update, which handling ignores.
    pub fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Unusable webhook payload: {e}");
            Update::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    FreeText,
}

/// Reads the command from the first word of `text`. `None` means the message
/// should be ignored: it is blank, or it is a command addressed to another bot
/// (`/start@other_bot`).
pub fn parse_command(text: &str, bot_name: &str) -> Option<Command> {
    let first = text.split_whitespace().next()?;
    let Some(command) = first.strip_prefix('/') else {
        return Some(Command::FreeText);
    };
    let (name, target) = match command.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (command, None),
    };
    if let Some(target) = target {
        if !target.eq_ignore_ascii_case(bot_name) {
            return None;
        }
    }
    Some(match name {
        "start" => Command::Start,
        "stop" => Command::Stop,
        _ => Command::FreeText,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    Started { chat_id: i64, delivered: bool },
    Stopped { chat_id: i64, delivered: bool },
    NothingToStop { chat_id: i64 },
    Help { chat_id: i64 },
    Ignored,
    Failed { chat_id: i64 },
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub struct WebhookProcessor {
    db: Arc<Database>,
    dispatcher: Arc<Dispatcher>,
    endpoint_url: String,
    bot_name: String,
}

impl WebhookProcessor {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Arc<Dispatcher>,
        endpoint_url: impl Into<String>,
        bot_name: impl Into<String>,
    ) -> Self {
        WebhookProcessor {
            db,
            dispatcher,
            endpoint_url: endpoint_url.into(),
            bot_name: bot_name.into(),
        }
    }

    /// Handles `update` on a task of its own. The caller does not need to
    /// await the handle.
    pub fn spawn(self: &Arc<Self>, update: Update) -> JoinHandle<WebhookAction> {
        let processor = Arc::clone(self);
        tokio::spawn(async move { processor.handle(update).await })
    }

    #[instrument(name = "webhook.update", skip_all, fields(update_id = update.update_id))]
    pub async fn handle(&self, update: Update) -> WebhookAction {
        let Some(message) = update.message else {
            info!("Update without a message, ignoring");
            return WebhookAction::Ignored;
        };
        let Some(chat_id) = message.chat.as_ref().and_then(|chat| chat.id) else {
            info!("Message without a chat id, ignoring");
            return WebhookAction::Ignored;
        };
        let text = message.text.as_deref().unwrap_or_default();
        let Some(command) = parse_command(text, &self.bot_name) else {
            return WebhookAction::Ignored;
        };
        let first_name = message
            .from
            .as_ref()
            .and_then(|from| from.first_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_USER_NAME);

        info!(chat_id, ?command, "Handling command");
        let action = match command {
            Command::Start => self.start(chat_id, first_name).await,
            Command::Stop => self.stop(chat_id).await,
            Command::FreeText => self.help(chat_id).await,
        };
        match action {
            Ok(action) => action,
            Err(e) => {
                error!(chat_id, "Failed to handle command: {e}");
                WebhookAction::Failed { chat_id }
            }
        }
    }

    async fn start(&self, chat_id: i64, first_name: &str) -> Result<WebhookAction, RelayError> {
        let record = call_blocking(self.db.clone(), move |db| db.issue_token(chat_id)).await?;
        info!(chat_id, token = %mask_token(&record.token), "Token issued");
        let welcome = self.welcome_message(first_name, &record);
        let delivered = self
            .dispatcher
            .send(Destination::Chat(chat_id), &welcome, Formatting::Html)
            .await
            .is_sent();
        Ok(WebhookAction::Started { chat_id, delivered })
    }

    async fn stop(&self, chat_id: i64) -> Result<WebhookAction, RelayError> {
        let revoked = call_blocking(self.db.clone(), move |db| {
            match db.lookup(&TokenKey::Chat(chat_id))? {
                Some(record) if record.is_active() => {
                    Ok(db.revoke(&record.token)?.then_some(record))
                }
                _ => Ok(None),
            }
        })
        .await?;

        let Some(record) = revoked else {
            let notice = "You have no active API token. Send /start to get one.";
            self.dispatcher
                .send(Destination::Chat(chat_id), notice, Formatting::Plain)
                .await;
            return Ok(WebhookAction::NothingToStop { chat_id });
        };

        info!(chat_id, token = %mask_token(&record.token), "Token revoked on request");
        let confirmation = format!(
            "API token <code>{}</code> deleted.\nBye!",
            escape_html(&record.token)
        );
        let delivered = self
            .dispatcher
            .send(Destination::Chat(chat_id), &confirmation, Formatting::Html)
            .await
            .is_sent();
        Ok(WebhookAction::Stopped { chat_id, delivered })
    }

    async fn help(&self, chat_id: i64) -> Result<WebhookAction, RelayError> {
        let help = "Available commands:\n/start - get your API token\n/stop - delete your API token";
        self.dispatcher
            .send(Destination::Chat(chat_id), help, Formatting::Plain)
            .await;
        Ok(WebhookAction::Help { chat_id })
    }

    fn welcome_message(&self, first_name: &str, record: &TokenRecord) -> String {
        let endpoint = escape_html(&self.endpoint_url);
        let token = escape_html(&record.token);
        format!(
            "👋 Hello, {name}!\n\n\
             Your API token: <code>{token}</code>\n\n\
             Send a message to this chat with a GET request:\n\
             <code>{endpoint}/{{token}}/{{text}}</code>\n\n\
             Example:\n\
             <code>GET {endpoint}/{token}/Hello%20World!</code>\n\n\
             To delete the token, send <code>/stop</code>",
            name = escape_html(first_name),
        )
    }
}
