use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{FvError, FvResult};

/// Top-level configuration (loaded from fieldvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldVaultConfig {
    pub kdf: KdfConfig,
    pub unlock: UnlockConfig,
    pub storage: StorageConfig,
    pub reset: ResetConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

/// Argon2id cost parameters used when provisioning new accounts.
///
/// Existing accounts keep the parameters persisted with their wrapped master
/// key; changing these only affects accounts provisioned afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub argon2_time_cost: u32,
    /// Parallelism (default: 4)
    pub argon2_parallelism: u32,
}

/// Retry policy for automatic unlock with a cached passphrase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockConfig {
    /// Total attempts, including the first (default: 4)
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 250)
    pub base_delay_ms: u64,
    /// Backoff multiplier applied after every retry (default: 2)
    pub multiplier: u32,
    /// Upper bound for a single delay in milliseconds (default: 4000)
    pub max_delay_ms: u64,
}

/// Text form used when writing binary columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEncoding {
    /// `\x` followed by lowercase hex, as relational bytea columns return it
    #[default]
    Hex,
    /// Standard base64 with padding
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON key/record store used by the CLI
    pub path: PathBuf,
    /// Encoding for newly written binary columns (reads accept both)
    pub encoding: StorageEncoding,
}

/// Guard rails for the destructive reset path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Deployment environment name; reset is always refused in "production"
    pub environment: String,
    /// Environment variable that must be set to "1" or "true" to allow reset
    pub allow_env: String,
}

/// Server-managed (non end-to-end) encryption of operational records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Environment variable holding the server secret
    pub secret_env: String,
    /// HKDF context separating this deployment's records from others
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl FieldVaultConfig {
    /// Parse a TOML document; missing sections and keys take their defaults.
    pub fn from_toml(content: &str) -> FvResult<Self> {
        toml::from_str(content).map_err(|e| FvError::Config(e.to_string()))
    }
}

impl ResetConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
            || self.environment.eq_ignore_ascii_case("prod")
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            multiplier: 2,
            max_delay_ms: 4000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/fieldvault/store.json"),
            encoding: StorageEncoding::Hex,
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            environment: "development".into(),
            allow_env: "FIELDVAULT_ALLOW_RESET".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            secret_env: "FIELDVAULT_SERVER_SECRET".into(),
            context: "operational-records".into(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[kdf]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8

[unlock]
max_attempts = 6
base_delay_ms = 100
multiplier = 3
max_delay_ms = 10000

[storage]
path = "/var/lib/fieldvault/store.json"
encoding = "base64"

[reset]
environment = "production"
allow_env = "MY_RESET_FLAG"

[server]
secret_env = "OPS_SECRET"
context = "audit-log"

[log]
level = "debug"
format = "json"
"#;
        let config: FieldVaultConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.kdf.argon2_mem_cost_kib, 131072);
        assert_eq!(config.kdf.argon2_parallelism, 8);
        assert_eq!(config.unlock.max_attempts, 6);
        assert_eq!(config.unlock.multiplier, 3);
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/fieldvault/store.json")
        );
        assert_eq!(config.storage.encoding, StorageEncoding::Base64);
        assert!(config.reset.is_production());
        assert_eq!(config.reset.allow_env, "MY_RESET_FLAG");
        assert_eq!(config.server.context, "audit-log");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config = FieldVaultConfig::from_toml("").unwrap();

        assert_eq!(config.kdf.argon2_mem_cost_kib, 65536);
        assert_eq!(config.kdf.argon2_time_cost, 3);
        assert_eq!(config.unlock.max_attempts, 4);
        assert_eq!(config.unlock.base_delay_ms, 250);
        assert_eq!(config.storage.encoding, StorageEncoding::Hex);
        assert!(!config.reset.is_production());
        assert_eq!(config.reset.allow_env, "FIELDVAULT_ALLOW_RESET");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[reset]
environment = "staging"
"#;
        let config: FieldVaultConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.reset.environment, "staging");
        // Defaults
        assert_eq!(config.reset.allow_env, "FIELDVAULT_ALLOW_RESET");
        assert_eq!(config.unlock.max_delay_ms, 4000);
        assert!(!config.reset.is_production());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = FieldVaultConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FieldVaultConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.path, parsed.storage.path);
        assert_eq!(config.storage.encoding, parsed.storage.encoding);
        assert_eq!(config.reset.allow_env, parsed.reset.allow_env);
    }
}
