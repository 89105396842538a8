use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::webhook::{Update, WebhookProcessor};
use relaygram_app::assets::{static_asset, static_content_type};
use relaygram_channels::chat_api::{ChatApi, Formatting};
use relaygram_channels::dispatch::{Delivery, Destination, Dispatcher, PermanentCause};
use relaygram_core::error::RelayError;
use relaygram_core::token::{is_valid_token, mask_token};
use relaygram_storage::db::{call_blocking, Database, TokenKey};

/// Largest relayed message, in bytes after URL decoding.
pub const MESSAGE_MAX_BYTES: usize = 1024;
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct WebState {
    db: Arc<Database>,
    dispatcher: Arc<Dispatcher>,
    processor: Arc<WebhookProcessor>,
    secret_digest: [u8; 32],
    bot_name: Arc<str>,
}

impl WebState {
    pub fn new(config: &Config, db: Arc<Database>, api: Arc<dyn ChatApi>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(api, db.clone()));
        let processor = Arc::new(WebhookProcessor::new(
            db.clone(),
            dispatcher.clone(),
            config.endpoint_url.clone(),
            config.bot_name.clone(),
        ));
        WebState {
            db,
            dispatcher,
            processor,
            secret_digest: Sha256::digest(config.webhook_secret().as_bytes()).into(),
            bot_name: Arc::from(config.bot_name.as_str()),
        }
    }

    fn secret_matches(&self, headers: &HeaderMap) -> bool {
        let Some(presented) = headers.get(SECRET_HEADER) else {
            return false;
        };
        let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        digest == self.secret_digest
    }
}

fn api_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    debug!(status = status.as_u16(), %message, "API response");
    let outcome = if status.is_success() { "success" } else { "error" };
    (status, Json(json!({"status": outcome, "message": message}))).into_response()
}

async fn index(State(state): State<WebState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; charset=utf-8")],
        format!(
            "Telegram Send Message Bot is running. Write to @{} to use it!",
            state.bot_name
        ),
    )
}

async fn webhook_ready() -> Response {
    api_response(StatusCode::OK, "Webhook endpoint is ready")
}

#[instrument(name = "http.webhook", skip_all)]
async fn webhook_post(State(state): State<WebState>, headers: HeaderMap, body: Bytes) -> Response {
    if !state.secret_matches(&headers) {
        warn!("Webhook call with a missing or wrong secret");
        return api_response(StatusCode::FORBIDDEN, "Oh, no!");
    }
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Webhook body is not JSON: {e}");
            return api_response(StatusCode::BAD_REQUEST, "Invalid JSON payload");
        }
    };
    state.processor.spawn(Update::from_value(payload));
    api_response(StatusCode::OK, "OK")
}

async fn method_not_allowed() -> Response {
    api_response(StatusCode::METHOD_NOT_ALLOWED, "Unknown method")
}

async fn not_found() -> Response {
    api_response(StatusCode::NOT_FOUND, "Not found")
}

/// Decodes a path segment the way HTML forms encode it: `+` is a space, then
/// percent escapes. `None` when the result is not UTF-8.
fn decode_text_segment(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|text| text.into_owned())
}

#[instrument(name = "http.send_by_token", skip_all, fields(token = tracing::field::Empty))]
async fn send_by_token(State(state): State<WebState>, uri: Uri) -> Response {
    let mut segments = uri.path().trim_start_matches('/').splitn(3, '/').skip(1);
    let (Some(token), Some(raw_text)) = (segments.next(), segments.next()) else {
        return not_found().await;
    };
    if !is_valid_token(token) {
        return not_found().await;
    }
    tracing::Span::current().record("token", mask_token(token).as_str());

    let Some(text) = decode_text_segment(raw_text) else {
        return api_response(StatusCode::BAD_REQUEST, "Message is not valid UTF-8");
    };
    if text.len() > MESSAGE_MAX_BYTES {
        return api_response(StatusCode::URI_TOO_LONG, "Too long message. Up to 1 Kbyte.");
    }

    let key = TokenKey::from(token);
    let record = match call_blocking(state.db.clone(), move |db| db.lookup(&key)).await {
        Ok(Some(record)) if record.is_active() => record,
        Ok(Some(_)) => {
            info!("Deleted token used");
            return api_response(StatusCode::UNAUTHORIZED, "Unknown or deleted Token");
        }
        Ok(None) => {
            info!("Unknown token used");
            return api_response(StatusCode::UNAUTHORIZED, "Unknown or deleted Token");
        }
        Err(e) => {
            error!("Token lookup failed: {e}");
            return api_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };

    match state
        .dispatcher
        .send(Destination::Token(&record), &text, Formatting::Plain)
        .await
    {
        Delivery::Sent(_) => api_response(StatusCode::OK, format!("Message sent: {text}")),
        Delivery::PermanentFailure(PermanentCause::RecipientGone { .. }) => {
            api_response(StatusCode::UNAUTHORIZED, "Unknown or deleted Token")
        }
        Delivery::TransientFailure(_)
        | Delivery::PermanentFailure(PermanentCause::Misconfigured(_)) => {
            api_response(StatusCode::SERVICE_UNAVAILABLE, "Send temporary failed")
        }
    }
}

async fn static_or_not_found(uri: Uri) -> Response {
    let path = uri.path();
    if let (Some(content_type), Some(contents)) = (static_content_type(path), static_asset(path)) {
        return ([("content-type", content_type)], contents).into_response();
    }
    not_found().await
}

pub fn build_router(state: WebState) -> Router {
    Router::new()
        .route("/", any(index))
        .route(
            "/api/webhook",
            get(webhook_ready)
                .post(webhook_post)
                .fallback(method_not_allowed),
        )
        .route("/api/:token/:text", get(send_by_token).fallback(not_found))
        .fallback(static_or_not_found)
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn start_web_server<F>(state: WebState, addr: &str, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind web server at {addr}: {e}");
        RelayError::Io(e)
    })?;
    info!("Relay listening on http://{addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Web server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cleanup, temp_database};
    use axum::body::Body;
    use axum::http::Request;
    use relaygram_channels::chat_api::SendErrorKind;
    use relaygram_channels::mock::MockChatApi;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret-Value_1";

    struct TestApp {
        router: Router,
        db: Arc<Database>,
        api: MockChatApi,
        dir: PathBuf,
    }

    impl TestApp {
        fn new() -> Self {
            let (db, dir) = temp_database();
            let api = MockChatApi::new();
            let config = Config {
                telegram_bot_token: "123:abc".into(),
                telegram_secret_token: Some(SECRET.into()),
                bot_name: "relay_bot".into(),
                webhook_url: "https://relay.example.com/api/webhook".into(),
                endpoint_url: "https://relay.example.com/api".into(),
                ..Config::default()
            };
            let state = WebState::new(&config, db.clone(), Arc::new(api.clone()));
            TestApp {
                router: build_router(state),
                db,
                api,
                dir,
            }
        }

        async fn call(&self, req: Request<Body>) -> (StatusCode, String, Option<String>) {
            let resp = self.router.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, String::from_utf8_lossy(&body).to_string(), content_type)
        }

        async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let (status, body, _) = self.call(req).await;
            (status, serde_json::from_str(&body).unwrap())
        }

        async fn post_webhook(&self, secret: Option<&str>, body: &str) -> StatusCode {
            let mut req = Request::builder()
                .method("POST")
                .uri("/api/webhook")
                .header("content-type", "application/json");
            if let Some(secret) = secret {
                req = req.header("X-Telegram-Bot-Api-Secret-Token", secret);
            }
            let (status, _, _) = self
                .call(req.body(Body::from(body.to_string())).unwrap())
                .await;
            status
        }

        fn issue(&self, chat_id: i64) -> String {
            self.db.issue_token(chat_id).unwrap().token
        }
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            cleanup(&self.dir);
        }
    }

    async fn wait_for_active_token(db: &Database, chat_id: i64) -> bool {
        for _ in 0..100 {
            if db.by_chat(chat_id).unwrap().is_some_and(|r| r.is_active()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    const START_UPDATE: &str =
        r#"{"message":{"text":"/start","chat":{"id":42},"from":{"first_name":"Ann"}}}"#;

    #[tokio::test]
    async fn test_root_is_plain_text() {
        let app = TestApp::new();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body, content_type) = app.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("@relay_bot"));
        assert!(content_type.unwrap().starts_with("text/plain"));

        let req = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let (status, body, _) = app.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("@relay_bot"));
    }

    #[tokio::test]
    async fn test_webhook_get_is_ready() {
        let app = TestApp::new();
        let (status, body) = app.get("/api/webhook").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Webhook endpoint is ready");
    }

    #[tokio::test]
    async fn test_webhook_other_method_is_405() {
        let app = TestApp::new();
        let req = Request::builder()
            .method("PUT")
            .uri("/api/webhook")
            .body(Body::empty())
            .unwrap();
        let (status, body, _) = app.call(req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(body.contains("Unknown method"));
    }

    #[tokio::test]
    async fn test_webhook_start_creates_token() {
        let app = TestApp::new();
        let status = app.post_webhook(Some(SECRET), START_UPDATE).await;
        assert_eq!(status, StatusCode::OK);
        assert!(wait_for_active_token(&app.db, 42).await);
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_even_when_delivery_fails() {
        let app = TestApp::new();
        app.api.fail_always(SendErrorKind::Server);
        let status = app.post_webhook(Some(SECRET), START_UPDATE).await;
        assert_eq!(status, StatusCode::OK);
        assert!(wait_for_active_token(&app.db, 42).await);
    }

    #[tokio::test]
    async fn test_webhook_wrong_secret_is_rejected_without_mutation() {
        let app = TestApp::new();
        assert_eq!(
            app.post_webhook(Some("wrong"), START_UPDATE).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            app.post_webhook(None, START_UPDATE).await,
            StatusCode::FORBIDDEN
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(app.db.by_chat(42).unwrap().is_none());
        assert!(app.api.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_invalid_json_is_400() {
        let app = TestApp::new();
        let status = app.post_webhook(Some(SECRET), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_unusable_update_is_acknowledged() {
        let app = TestApp::new();
        let status = app
            .post_webhook(Some(SECRET), r#"{"edited_message":{"text":"/start"}}"#)
            .await;
        assert_eq!(status, StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(app.api.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_send_by_token() {
        let app = TestApp::new();
        let token = app.issue(42);
        let (status, body) = app.get(&format!("/api/{token}/Hello%20World")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Message sent: Hello World");

        let sent = app.api.attempts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 42);
        assert_eq!(sent[0].text, "Hello World");
        assert_eq!(sent[0].formatting, Formatting::Plain);
    }

    #[test]
    fn test_decode_text_segment() {
        assert_eq!(decode_text_segment("Hello+World").as_deref(), Some("Hello World"));
        assert_eq!(decode_text_segment("1%2B1").as_deref(), Some("1+1"));
        assert_eq!(decode_text_segment("caf%C3%A9").as_deref(), Some("café"));
        assert_eq!(decode_text_segment("%FF%FE"), None);
    }

    #[tokio::test]
    async fn test_send_decodes_plus_as_space() {
        let app = TestApp::new();
        let token = app.issue(42);
        let (status, body) = app.get(&format!("/api/{token}/Hello+World")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Message sent: Hello World");

        let (status, _) = app.get(&format!("/api/{token}/2%2B2")).await;
        assert_eq!(status, StatusCode::OK);

        let sent = app.api.attempts();
        assert_eq!(sent[0].text, "Hello World");
        assert_eq!(sent[1].text, "2+2");
    }

    #[tokio::test]
    async fn test_send_invalid_utf8_text_is_400() {
        let app = TestApp::new();
        let token = app.issue(42);
        let (status, body) = app.get(&format!("/api/{token}/%FF%FE")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Message is not valid UTF-8");
        assert!(app.api.attempts().is_empty());

        let (status, _) = app.get("/api/short/%FF%FE").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_blocked_revokes_token() {
        let app = TestApp::new();
        let token = app.issue(42);
        app.api.fail_next(SendErrorKind::Blocked);

        let (status, _) = app.get(&format!("/api/{token}/Hello")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!app.db.by_token(&token).unwrap().unwrap().is_active());

        let (status, body) = app.get(&format!("/api/{token}/Hello")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Unknown or deleted Token");
        assert_eq!(app.api.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_send_transient_failure_is_503() {
        let app = TestApp::new();
        let token = app.issue(42);
        app.api.fail_next(SendErrorKind::RateLimited);
        let (status, body) = app.get(&format!("/api/{token}/Hello")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["message"], "Send temporary failed");
        assert!(app.db.by_token(&token).unwrap().unwrap().is_active());

        app.api.fail_next(SendErrorKind::Unauthorized);
        let (status, _) = app.get(&format!("/api/{token}/Hello")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(app.db.by_token(&token).unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_send_oversize_is_rejected_before_sending() {
        let app = TestApp::new();
        let token = app.issue(42);

        let long = "a".repeat(MESSAGE_MAX_BYTES + 1);
        let (status, _) = app.get(&format!("/api/{token}/{long}")).await;
        assert_eq!(status, StatusCode::URI_TOO_LONG);

        let wide = urlencoding::encode(&"é".repeat(MESSAGE_MAX_BYTES / 2 + 1)).into_owned();
        let (status, _) = app.get(&format!("/api/{token}/{wide}")).await;
        assert_eq!(status, StatusCode::URI_TOO_LONG);
        assert!(app.api.attempts().is_empty());

        let exact = "b".repeat(MESSAGE_MAX_BYTES);
        let (status, _) = app.get(&format!("/api/{token}/{exact}")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_send_unknown_or_revoked_token_is_401() {
        let app = TestApp::new();
        let (status, _) = app.get("/api/AAAAAAAAAAAAAAAA/Hello").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = app.issue(42);
        app.db.revoke(&token).unwrap();
        let (status, _) = app.get(&format!("/api/{token}/Hello")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(app.api.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_token_shape_is_404() {
        let app = TestApp::new();
        for uri in [
            "/api/short/Hello",
            "/api/AAAAAAAAAAAAAAAAA/Hello",
            "/api/AAAAAAAAAAAAAA!A/Hello",
            "/api/AAAAAAAAAAAAAAAA/Hello/extra",
            "/api/AAAAAAAAAAAAAAAA",
        ] {
            let (status, body) = app.get(uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["status"], "error");
        }
    }

    #[tokio::test]
    async fn test_static_assets() {
        let app = TestApp::new();
        let req = Request::builder()
            .uri("/manifest.json")
            .body(Body::empty())
            .unwrap();
        let (status, _, content_type) = app.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let req = Request::builder().uri("/icon.svg").body(Body::empty()).unwrap();
        let (status, _, content_type) = app.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/svg+xml"));

        let (status, _) = app.get("/missing.png").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let app = TestApp::new();
        let (status, body) = app.get("/nothing/here").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Not found");
    }
}
