use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("No unused token found after {0} attempts")]
    TokenSpaceExhausted(usize),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Messaging platform error: {0}")]
    Platform(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let e = RelayError::Config("missing key".into());
        assert_eq!(e.to_string(), "Config error: missing key");

        let e = RelayError::TokenSpaceExhausted(16);
        assert_eq!(e.to_string(), "No unused token found after 16 attempts");

        let e = RelayError::Task("join failed".into());
        assert_eq!(e.to_string(), "Task error: join failed");

        let e = RelayError::Platform("Unauthorized".into());
        assert_eq!(e.to_string(), "Messaging platform error: Unauthorized");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let e: RelayError = io_err.into();
        assert!(e.to_string().contains("not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{invalid").unwrap_err();
        let e: RelayError = json_err.into();
        assert!(e.to_string().contains("JSON error"));
    }

    #[test]
    fn test_error_from_sqlite() {
        let e: RelayError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, RelayError::Database(_)));
    }
}
