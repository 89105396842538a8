use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_storage_path() -> String {
    "/db".into()
}
fn default_server_addr() -> String {
    "0.0.0.0".into()
}
fn default_server_port() -> u16 {
    80
}
fn default_log_level() -> String {
    "info".into()
}

const SECRET_MAX_LEN: usize = 256;
const GENERATED_SECRET_BYTES: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram_bot_token: String,
    /// Shared secret the platform echoes in every webhook call. Generated at
    /// startup when not configured.
    #[serde(default)]
    pub telegram_secret_token: Option<String>,
    /// Bot username, without the leading `@`.
    #[serde(default)]
    pub bot_name: String,
    /// Public URL the platform pushes updates to, e.g.
    /// `https://relay.example.com/api/webhook`.
    #[serde(default)]
    pub webhook_url: String,
    /// Public base of the send route shown to users, e.g.
    /// `https://relay.example.com/api`.
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Leave the platform's webhook registration untouched at startup.
    #[serde(default)]
    pub skip_webhook_setup: bool,
    #[serde(skip)]
    pub secret_generated: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            telegram_bot_token: String::new(),
            telegram_secret_token: None,
            bot_name: String::new(),
            webhook_url: String::new(),
            endpoint_url: String::new(),
            storage_path: default_storage_path(),
            server_addr: default_server_addr(),
            server_port: default_server_port(),
            log_level: default_log_level(),
            skip_webhook_setup: false,
            secret_generated: false,
        }
    }
}

fn generate_secret() -> String {
    let bytes: [u8; GENERATED_SECRET_BYTES] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, RelayError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(RelayError::Config(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

fn validate_http_url(name: &str, raw: &str) -> Result<(), RelayError> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| RelayError::Config(format!("{name} is not a valid URL ({raw}): {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RelayError::Config(format!(
            "{name} must use http or https: {raw}"
        )));
    }
    Ok(())
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    pub fn webhook_secret(&self) -> &str {
        self.telegram_secret_token.as_deref().unwrap_or_default()
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, RelayError> {
        if let Ok(custom) = std::env::var("RELAYGRAM_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(RelayError::Config(format!(
                "RELAYGRAM_CONFIG points to non-existent file: {custom}"
            )));
        }

        for candidate in ["./relaygram.config.yaml", "./relaygram.config.yml"] {
            if std::path::Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    /// Loads the optional YAML file, then applies process environment
    /// overrides.
    pub fn load() -> Result<Self, RelayError> {
        let yaml = match Self::resolve_config_path()? {
            Some(path) => {
                let path_str = path.to_string_lossy().to_string();
                Some(std::fs::read_to_string(&path).map_err(|e| {
                    RelayError::Config(format!("Failed to read {path_str}: {e}"))
                })?)
            }
            None => None,
        };
        Self::from_sources(yaml.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn from_sources<F>(yaml: Option<&str>, env: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match yaml.filter(|content| !content.trim().is_empty()) {
            Some(content) => serde_yaml::from_str::<Config>(content)
                .map_err(|e| RelayError::Config(format!("Failed to parse config file: {e}")))?,
            None => Config::default(),
        };
        config.apply_env(env)?;
        config.post_deserialize()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = v;
        }
        if let Some(v) = env("TELEGRAM_SECRET_TOKEN") {
            self.telegram_secret_token = Some(v);
        }
        if let Some(v) = env("TELEGRAM_BOT_NAME") {
            self.bot_name = v;
        }
        if let Some(v) = env("WEBHOOK_URL") {
            self.webhook_url = v;
        }
        if let Some(v) = env("ENDPOINT_URL") {
            self.endpoint_url = v;
        }
        if let Some(v) = env("STORAGE_PATH") {
            self.storage_path = v;
        }
        if let Some(v) = env("SERVER_ADDR") {
            self.server_addr = v;
        }
        if let Some(v) = env("SERVER_PORT") {
            self.server_port = v.trim().parse().map_err(|_| {
                RelayError::Config(format!("SERVER_PORT must be a port number, got '{v}'"))
            })?;
        }
        if let Some(v) = env("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = env("SKIP_WEBHOOK_SETUP") {
            self.skip_webhook_setup = parse_flag("SKIP_WEBHOOK_SETUP", &v)?;
        }
        Ok(())
    }

    /// Apply post-deserialization normalization and validation.
    pub(crate) fn post_deserialize(&mut self) -> Result<(), RelayError> {
        self.telegram_bot_token = self.telegram_bot_token.trim().to_string();
        self.bot_name = self.bot_name.trim().trim_start_matches('@').to_string();
        self.webhook_url = self.webhook_url.trim().to_string();
        self.endpoint_url = self.endpoint_url.trim().trim_end_matches('/').to_string();
        self.storage_path = self.storage_path.trim().to_string();
        self.server_addr = self.server_addr.trim().to_string();

        if self.storage_path.is_empty() {
            self.storage_path = default_storage_path();
        }
        if self.server_addr.is_empty() {
            self.server_addr = default_server_addr();
        }
        if self.log_level.trim().is_empty() {
            self.log_level = default_log_level();
        }

        for (name, value) in [
            ("TELEGRAM_BOT_TOKEN", &self.telegram_bot_token),
            ("TELEGRAM_BOT_NAME", &self.bot_name),
            ("WEBHOOK_URL", &self.webhook_url),
            ("ENDPOINT_URL", &self.endpoint_url),
        ] {
            if value.is_empty() {
                return Err(RelayError::Config(format!("{name} is required")));
            }
        }
        validate_http_url("WEBHOOK_URL", &self.webhook_url)?;
        validate_http_url("ENDPOINT_URL", &self.endpoint_url)?;
        if self.server_port == 0 {
            return Err(RelayError::Config("SERVER_PORT must be non-zero".into()));
        }

        match self
            .telegram_secret_token
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(secret) => {
                if secret.len() > SECRET_MAX_LEN || !secret.chars().all(is_secret_char) {
                    return Err(RelayError::Config(
                        "TELEGRAM_SECRET_TOKEN must be 1-256 characters of A-Z, a-z, 0-9, _ and -"
                            .into(),
                    ));
                }
                self.telegram_secret_token = Some(secret.to_string());
                self.secret_generated = false;
            }
            None => {
                self.telegram_secret_token = Some(generate_secret());
                self.secret_generated = true;
            }
        }

        Ok(())
    }
}
