use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Builds the filter for the process. `RUST_LOG`, when set, wins over the
/// configured level so operators can raise verbosity for one module without
/// touching config.
pub fn build_env_filter(level: &str, rust_log: Option<&str>) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        return EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid RUST_LOG directives: {directives}"));
    }
    let level: tracing::Level = level
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {level}"))?;
    Ok(EnvFilter::default().add_directive(level.into()))
}

pub fn init_logging(level: &str) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_env_filter(level, rust_log.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_level_is_applied() {
        let filter = build_env_filter("debug", None).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_level_is_case_insensitive() {
        assert!(build_env_filter("WARN", None).is_ok());
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = build_env_filter("loud", None).unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_rust_log_overrides_level() {
        let filter = build_env_filter("info", Some("relaygram=trace")).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_blank_rust_log_falls_back_to_level() {
        let filter = build_env_filter("error", Some("  ")).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::ERROR));
    }
}
