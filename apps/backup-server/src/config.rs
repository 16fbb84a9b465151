//! Configuration management for the backup server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid BOOTSTRAP_CLIENTS entry: {0:?} (expected id:api_key)")]
    InvalidClientEntry(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    #[serde(default)]
    pub bootstrap_clients: Vec<BootstrapClient>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the finalized artifact tree (`<client>/<backup>/v<version>/...`)
    pub backup_root: PathBuf,
    /// Root of per-session chunk scratch folders
    pub chunk_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Idle window after which a session is eligible for garbage collection
    pub session_idle_secs: u64,
    /// How often the expiry sweep runs
    pub cleanup_interval_secs: u64,
    /// Largest accepted chunk body
    pub max_chunk_size: usize,
    /// Largest accepted declared chunk count
    pub max_total_chunks: u32,
    /// Re-read each artifact after assembly and compare digests
    pub verify_after_write: bool,
}

/// Credentials seeded into the clients table at startup
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapClient {
    pub client_id: String,
    pub api_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./backups.db".to_string(),
                max_connections: 5,
            },
            storage: StorageConfig {
                backup_root: PathBuf::from("./data/backups"),
                chunk_root: PathBuf::from("./data/chunks"),
            },
            upload: UploadConfig::default(),
            bootstrap_clients: Vec::new(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            session_idle_secs: 6 * 60 * 60,
            cleanup_interval_secs: 300,
            max_chunk_size: 64 * 1024 * 1024,
            max_total_chunks: 100_000,
            verify_after_write: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            storage: StorageConfig {
                backup_root: env::var("BACKUP_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.backup_root),
                chunk_root: env::var("CHUNK_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.chunk_root),
            },
            upload: UploadConfig {
                session_idle_secs: parse_var(
                    "UPLOAD_SESSION_IDLE_SECS",
                    defaults.upload.session_idle_secs,
                )?,
                cleanup_interval_secs: parse_var(
                    "UPLOAD_CLEANUP_INTERVAL_SECS",
                    defaults.upload.cleanup_interval_secs,
                )?,
                max_chunk_size: parse_var("UPLOAD_MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
                max_total_chunks: parse_var(
                    "UPLOAD_MAX_TOTAL_CHUNKS",
                    defaults.upload.max_total_chunks,
                )?,
                verify_after_write: parse_var(
                    "UPLOAD_VERIFY_AFTER_WRITE",
                    defaults.upload.verify_after_write,
                )?,
            },
            bootstrap_clients: match env::var("BOOTSTRAP_CLIENTS") {
                Ok(raw) => parse_bootstrap_clients(&raw)?,
                Err(_) => Vec::new(),
            },
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

/// Parse `id:api_key[,id:api_key]`
pub fn parse_bootstrap_clients(raw: &str) -> Result<Vec<BootstrapClient>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (client_id, api_key) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidClientEntry(entry.to_string()))?;
            let (client_id, api_key) = (client_id.trim(), api_key.trim());
            if client_id.is_empty() || api_key.is_empty() {
                return Err(ConfigError::InvalidClientEntry(entry.to_string()));
            }
            Ok(BootstrapClient {
                client_id: client_id.to_string(),
                api_key: api_key.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_clients() {
        let clients = parse_bootstrap_clients("acme:k1, globex:k2,").unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].client_id, "acme");
        assert_eq!(clients[1].api_key, "k2");
    }

    #[test]
    fn test_parse_bootstrap_clients_rejects_missing_key() {
        assert!(matches!(
            parse_bootstrap_clients("acme"),
            Err(ConfigError::InvalidClientEntry(_))
        ));
        assert!(parse_bootstrap_clients("acme:").is_err());
    }
}
