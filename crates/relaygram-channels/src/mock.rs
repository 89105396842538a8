//! Scriptable [`ChatApi`] for tests without a live messaging platform.
//!
//! Enabled with the `test-support` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::chat_api::{ChatApi, Formatting, MessageRef, SendError, SendErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub formatting: Formatting,
}

/// Succeeds unless a failure was queued with [`MockChatApi::fail_next`] or
/// [`MockChatApi::fail_always`].
#[derive(Clone, Default)]
pub struct MockChatApi {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    queued_failures: Arc<Mutex<VecDeque<SendErrorKind>>>,
    sticky_failure: Arc<Mutex<Option<SendErrorKind>>>,
    webhook: Arc<Mutex<Option<(String, String)>>>,
    set_webhook_calls: Arc<Mutex<usize>>,
    next_message_id: Arc<AtomicI32>,
}

impl MockChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, kind: SendErrorKind) {
        self.queued_failures.lock().unwrap().push_back(kind);
    }

    pub fn fail_always(&self, kind: SendErrorKind) {
        *self.sticky_failure.lock().unwrap() = Some(kind);
    }

    pub fn with_webhook(self, url: &str, secret: &str) -> Self {
        *self.webhook.lock().unwrap() = Some((url.to_string(), secret.to_string()));
        self
    }

    /// Every send attempt, successful or not, in call order.
    pub fn attempts(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn registered_webhook(&self) -> Option<(String, String)> {
        self.webhook.lock().unwrap().clone()
    }

    pub fn set_webhook_calls(&self) -> usize {
        *self.set_webhook_calls.lock().unwrap()
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        formatting: Formatting,
    ) -> Result<MessageRef, SendError> {
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_string(),
            formatting,
        });
        let failure = self
            .queued_failures
            .lock()
            .unwrap()
            .pop_front()
            .or(*self.sticky_failure.lock().unwrap());
        if let Some(kind) = failure {
            return Err(SendError::new(kind, "scripted failure"));
        }
        Ok(MessageRef {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1,
            chat_id,
        })
    }

    async fn webhook_url(&self) -> Result<Option<String>, SendError> {
        Ok(self.webhook.lock().unwrap().as_ref().map(|(url, _)| url.clone()))
    }

    async fn set_webhook(&self, url: &str, secret: &str) -> Result<(), SendError> {
        *self.set_webhook_calls.lock().unwrap() += 1;
        *self.webhook.lock().unwrap() = Some((url.to_string(), secret.to_string()));
        Ok(())
    }
}
