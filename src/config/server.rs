use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 5103;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database: PathBuf,
    /// Public origin of this service (e.g. "https://todo.example.org").
    /// Used for mention URLs, dump `upstream` fields and webhook callbacks.
    pub origin: String,
    /// Origin of the identity service that owns user profiles.
    pub meta_origin: String,
    /// Shared secret for service-to-service auth and payload signatures.
    pub internal_key: String,
    pub loader_wait_ms: u64,
    pub loader_max_batch: usize,
    pub import_timeout_secs: u64,
    pub webhook_max_attempts: u32,
}

impl ServerConfig {
    /// Reads a TOML config file. Keys absent from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.origin.is_empty() {
            return Err(Error::Config("origin must be set".into()));
        }
        if self.meta_origin.is_empty() {
            return Err(Error::Config("meta_origin must be set".into()));
        }
        if self.internal_key.len() < 16 {
            return Err(Error::Config(
                "internal_key must be at least 16 characters".into(),
            ));
        }
        if self.loader_max_batch == 0 {
            return Err(Error::Config("loader_max_batch must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn loader_wait(&self) -> Duration {
        Duration::from_millis(self.loader_wait_ms)
    }

    #[must_use]
    pub fn import_timeout(&self) -> Duration {
        Duration::from_secs(self.import_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            database: PathBuf::from("./data/bugnest.db"),
            origin: String::new(),
            meta_origin: String::new(),
            internal_key: String::new(),
            loader_wait_ms: 1,
            loader_max_batch: 100,
            import_timeout_secs: 600,
            webhook_max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5103);
        assert_eq!(config.loader_max_batch, 100);
        assert_eq!(config.import_timeout(), Duration::from_secs(600));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_keeps_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("bugnest.toml");
        std::fs::write(
            &path,
            "origin = \"https://todo.example.org\"\n\
             meta_origin = \"https://meta.example.org\"\n\
             internal_key = \"0123456789abcdef0123\"\n\
             port = 9000\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.loader_wait_ms, 1);
        assert!(config.validate().is_ok());
    }
}
