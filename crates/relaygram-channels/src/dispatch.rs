use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::chat_api::{ChatApi, Formatting, MessageRef, SendError, SendErrorKind};
use relaygram_core::token::mask_token;
use relaygram_storage::db::{call_blocking, Database, TokenRecord};

/// Where a message goes. Internal replies address the chat directly; relayed
/// messages carry the token record they were authorized by.
#[derive(Debug, Clone, Copy)]
pub enum Destination<'a> {
    Chat(i64),
    Token(&'a TokenRecord),
}

impl Destination<'_> {
    pub fn chat_id(&self) -> i64 {
        match self {
            Destination::Chat(chat_id) => *chat_id,
            Destination::Token(record) => record.chat_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentCause {
    /// The recipient blocked the bot. `revoked` tells whether a token was
    /// soft-deleted as a consequence.
    RecipientGone { revoked: bool },
    /// The platform rejected the bot credential itself.
    Misconfigured(SendErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(MessageRef),
    TransientFailure(SendErrorKind),
    PermanentFailure(PermanentCause),
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent(_))
    }
}

/// Single-attempt outbound delivery. Retrying is left to callers; none of the
/// current ones do.
pub struct Dispatcher {
    api: Arc<dyn ChatApi>,
    db: Arc<Database>,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn ChatApi>, db: Arc<Database>) -> Self {
        Dispatcher { api, db }
    }

    #[instrument(name = "dispatch.send", skip_all, fields(chat_id = destination.chat_id()))]
    pub async fn send(
        &self,
        destination: Destination<'_>,
        text: &str,
        formatting: Formatting,
    ) -> Delivery {
        match self
            .api
            .send_message(destination.chat_id(), text, formatting)
            .await
        {
            Ok(message) => {
                info!(message_id = message.message_id, "Message delivered");
                Delivery::Sent(message)
            }
            Err(err) => self.classify(destination, err).await,
        }
    }

    async fn classify(&self, destination: Destination<'_>, err: SendError) -> Delivery {
        match err.kind {
            SendErrorKind::Blocked => {
                warn!("Delivery refused, recipient is gone: {err}");
                let revoked = self.revoke_destination(destination).await;
                Delivery::PermanentFailure(PermanentCause::RecipientGone { revoked })
            }
            SendErrorKind::Unauthorized | SendErrorKind::BotNotFound => {
                error!("Platform rejected the bot credential, check configuration: {err}");
                Delivery::PermanentFailure(PermanentCause::Misconfigured(err.kind))
            }
            SendErrorKind::MalformedResponse => {
                error!("Unexpected response from platform: {err}");
                Delivery::TransientFailure(err.kind)
            }
            SendErrorKind::BadRequest
            | SendErrorKind::RateLimited
            | SendErrorKind::Server
            | SendErrorKind::Network
            | SendErrorKind::Other => {
                warn!("Delivery failed: {err}");
                Delivery::TransientFailure(err.kind)
            }
        }
    }

    /// Only a token-authorized destination is revoked. Replies addressed to a
    /// bare chat id leave the store untouched.
    async fn revoke_destination(&self, destination: Destination<'_>) -> bool {
        let Destination::Token(record) = destination else {
            return false;
        };
        let token = record.token.clone();
        match call_blocking(self.db.clone(), move |db| db.revoke(&token)).await {
            Ok(revoked) => {
                info!(token = %mask_token(&record.token), revoked, "Token revoked after block");
                revoked
            }
            Err(e) => {
                error!("Failed to revoke token for blocked chat: {e}");
                false
            }
        }
    }
}
