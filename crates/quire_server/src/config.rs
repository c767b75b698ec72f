use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quire_core::config::CoordinatorConfig;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Database file path (default: ./quire.db)
    pub database_path: PathBuf,
    /// Target type of documents served by this instance (default: doc)
    pub doc_type: String,
    /// Save worker settings, from `COORDINATOR_CONFIG` if set
    pub coordinator: CoordinatorConfig,
    /// Entries per history page (default: 30)
    pub history_page_size: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = lookup("PORT")
            .unwrap_or_else(|| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path =
            PathBuf::from(lookup("DATABASE_PATH").unwrap_or_else(|| "./quire.db".to_string()));

        let doc_type = lookup("DOC_TYPE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "doc".to_string());

        let mut coordinator = match lookup("COORDINATOR_CONFIG") {
            Some(path) => CoordinatorConfig::load(Path::new(&path))
                .map_err(|e| ConfigError::Coordinator(format!("{}: {}", path, e)))?,
            None => CoordinatorConfig::default(),
        };
        if let Some(ms) = lookup("SAVE_DEBOUNCE_MS") {
            let ms: u64 = ms.parse().map_err(|_| ConfigError::InvalidDebounce)?;
            coordinator = coordinator.with_debounce(Duration::from_millis(ms));
        }

        let history_page_size = match lookup("HISTORY_PAGE_SIZE") {
            Some(size) => match size.parse() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::InvalidPageSize),
            },
            None => 30,
        };

        Ok(Config {
            host,
            port,
            database_path,
            doc_type,
            coordinator,
            history_page_size,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidDebounce,
    InvalidPageSize,
    Coordinator(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidDebounce => {
                write!(f, "Invalid SAVE_DEBOUNCE_MS environment variable")
            }
            ConfigError::InvalidPageSize => {
                write!(f, "Invalid HISTORY_PAGE_SIZE environment variable")
            }
            ConfigError::Coordinator(e) => write!(f, "Invalid coordinator config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3030");
        assert_eq!(config.database_path, PathBuf::from("./quire.db"));
        assert_eq!(config.doc_type, "doc");
        assert_eq!(config.history_page_size, 30);
        assert_eq!(config.coordinator, CoordinatorConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "8080"),
            ("DOC_TYPE", "note"),
            ("SAVE_DEBOUNCE_MS", "250"),
            ("HISTORY_PAGE_SIZE", "10"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.doc_type, "note");
        assert_eq!(config.coordinator.debounce(), Duration::from_millis(250));
        assert_eq!(config.history_page_size, 10);
    }

    #[test]
    fn test_coordinator_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.toml");
        std::fs::write(&path, "debounce_ms = 400\nmax_buffered_updates = 50\n").unwrap();

        let config = config(&[
            ("COORDINATOR_CONFIG", path.to_str().unwrap()),
            ("SAVE_DEBOUNCE_MS", "100"),
        ])
        .unwrap();
        assert_eq!(config.coordinator.debounce(), Duration::from_millis(100));
        assert_eq!(config.coordinator.max_buffered_updates, Some(50));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(config(&[("PORT", "http")]), Err(ConfigError::InvalidPort)));
        assert!(matches!(
            config(&[("HISTORY_PAGE_SIZE", "0")]),
            Err(ConfigError::InvalidPageSize)
        ));
        assert!(matches!(
            config(&[("COORDINATOR_CONFIG", "/nonexistent/quire.toml")]),
            Err(ConfigError::Coordinator(_))
        ));
    }
}
