use async_trait::async_trait;

/// How the platform should render outbound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formatting {
    Plain,
    Html,
}

/// Identifies a message the platform accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub message_id: i32,
    pub chat_id: i64,
}

/// Failure classes of an outbound platform call. Produced by the
/// [`ChatApi`] implementation so callers never inspect raw status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// 400: the platform refused the request parameters.
    BadRequest,
    /// 401: the bot credential is wrong.
    Unauthorized,
    /// 403: the recipient blocked the bot or no longer exists.
    Blocked,
    /// 404: the bot itself is unknown to the platform.
    BotNotFound,
    /// 429
    RateLimited,
    /// 5xx
    Server,
    Network,
    /// The call returned neither a message nor a recognizable error.
    MalformedResponse,
    Other,
}

impl SendErrorKind {
    /// Classifies a raw HTTP status from the platform.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => SendErrorKind::BadRequest,
            401 => SendErrorKind::Unauthorized,
            403 => SendErrorKind::Blocked,
            404 => SendErrorKind::BotNotFound,
            429 => SendErrorKind::RateLimited,
            500..=599 => SendErrorKind::Server,
            _ => SendErrorKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SendErrorKind::BadRequest => "wrong request parameters",
            SendErrorKind::Unauthorized => "wrong bot token",
            SendErrorKind::Blocked => "blocked by user",
            SendErrorKind::BotNotFound => "bot not found",
            SendErrorKind::RateLimited => "too many requests",
            SendErrorKind::Server => "platform error",
            SendErrorKind::Network => "network error",
            SendErrorKind::MalformedResponse => "unexpected response",
            SendErrorKind::Other => "unknown error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {detail}", .kind.as_str())]
pub struct SendError {
    pub kind: SendErrorKind,
    pub detail: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, detail: impl Into<String>) -> Self {
        SendError {
            kind,
            detail: detail.into(),
        }
    }
}

/// The messaging platform as seen by the relay.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        formatting: Formatting,
    ) -> Result<MessageRef, SendError>;

    /// Currently registered webhook URL, `None` when updates are not pushed.
    async fn webhook_url(&self) -> Result<Option<String>, SendError>;

    async fn set_webhook(&self, url: &str, secret: &str) -> Result<(), SendError>;
}
