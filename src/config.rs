//! 迁移工具配置
//!
//! 加载顺序（后者覆盖前者）：
//!
//! 1. 内置默认值
//! 2. 可选的 TOML 配置文件（默认 `drive-migrate.toml`）
//! 3. `DRIVE_MIGRATE__*` 环境变量（启动时先由 `dotenvy` 载入 `.env`）
//!
//! ```toml
//! root_dir = "/var/lib/app"
//! store_path = "drive"
//! key_pair_file = "/etc/app/drive.key.json"
//! encryption_key = "00112233..."
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::crypto::{ContentKey, CryptoError, FeedKeyPair};
use crate::migration::extractor::DEFAULT_CHANNEL_CAPACITY;
use crate::migration::pipeline::{MigrationOptions, MigrationRequest, DEFAULT_DISK_MARGIN_MB};
use crate::migration::snapshot::Checkpoint;
use crate::migration::transformer::DEFAULT_PREVIEW_WORDS;
use crate::migration::{MigrationError, DEFAULT_STAGING_DIR};

/// 默认配置文件（不含扩展名，由 `config` 按格式探测）
pub const DEFAULT_CONFIG_FILE: &str = "drive-migrate";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "DRIVE_MIGRATE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot read keypair file {path}: {reason}")]
    KeyPair { path: PathBuf, reason: String },

    #[error("invalid encryption key: {0}")]
    EncryptionKey(#[source] CryptoError),

    #[error("cannot load seed snapshot: {0}")]
    Seed(#[source] MigrationError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub root_dir: PathBuf,
    pub store_path: String,
    pub staging_dir: String,
    pub preview_words: usize,
    pub channel_capacity: usize,
    pub check_disk_space: bool,
    pub disk_margin_mb: u64,
    /// main 日志签名密钥对（JSON：`{"publicKey": .., "secretKey": ..}`）
    pub key_pair_file: Option<PathBuf>,
    /// 内容加密密钥（hex）
    pub encryption_key: Option<String>,
    /// 预置快照文件（检查点格式）
    pub seed_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            store_path: "drive".to_string(),
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            preview_words: DEFAULT_PREVIEW_WORDS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            check_disk_space: true,
            disk_margin_mb: DEFAULT_DISK_MARGIN_MB,
            key_pair_file: None,
            encryption_key: None,
            seed_file: None,
            log_filter: "info".to_string(),
        }
    }
}

impl MigrationConfig {
    /// 从配置文件与环境变量加载
    ///
    /// `file` 为 `None` 时尝试默认配置文件，不存在则跳过；显式给出的文件必须存在。
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let environment = config::Environment::with_prefix(ENV_PREFIX).separator("__");
        Self::from_sources(file, environment)
    }

    fn from_sources(
        file: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        match file {
            Some(path) if !path.exists() => {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Some(path) => {
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                builder = builder
                    .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));
            }
        }
        let loaded: MigrationConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        tracing::debug!(
            "[Config] 配置已加载: root_dir={}, store_path={}",
            loaded.root_dir.display(),
            loaded.store_path
        );
        Ok(loaded)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let single_component = |name: &str| {
            !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
        };
        if !single_component(&self.store_path) {
            return Err(ConfigError::Invalid {
                field: "store_path",
                reason: format!("'{}' must be a single directory name", self.store_path),
            });
        }
        if !single_component(&self.staging_dir) || self.staging_dir == self.store_path {
            return Err(ConfigError::Invalid {
                field: "staging_dir",
                reason: format!(
                    "'{}' must be a single directory name different from the store",
                    self.staging_dir
                ),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            staging_dir: self.staging_dir.clone(),
            preview_words: self.preview_words,
            channel_capacity: self.channel_capacity,
            check_disk_space: self.check_disk_space,
            disk_margin_mb: self.disk_margin_mb,
        }
    }

    pub fn key_pair(&self) -> Result<FeedKeyPair, ConfigError> {
        let path = self
            .key_pair_file
            .as_ref()
            .ok_or(ConfigError::Missing("key_pair_file"))?;
        let key_error = |reason: String| ConfigError::KeyPair {
            path: path.clone(),
            reason,
        };
        let bytes = fs::read(path).map_err(|e| key_error(e.to_string()))?;
        let pair: FeedKeyPair =
            serde_json::from_slice(&bytes).map_err(|e| key_error(e.to_string()))?;
        if !pair.is_consistent() {
            return Err(key_error(
                "public key does not match the secret key".to_string(),
            ));
        }
        Ok(pair)
    }

    pub fn encryption_key(&self) -> Result<ContentKey, ConfigError> {
        let encoded = self
            .encryption_key
            .as_deref()
            .ok_or(ConfigError::Missing("encryption_key"))?;
        ContentKey::from_hex(encoded).map_err(ConfigError::EncryptionKey)
    }

    /// 组装迁移请求
    pub fn request(&self) -> Result<MigrationRequest, ConfigError> {
        let seed = match &self.seed_file {
            Some(path) => Some(Checkpoint::new(path).load().map_err(ConfigError::Seed)?),
            None => None,
        };
        Ok(MigrationRequest {
            root_dir: self.root_dir.clone(),
            store_path: self.store_path.clone(),
            key_pair: self.key_pair()?,
            encryption_key: self.encryption_key()?,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(Some(map))
    }

    #[test]
    fn defaults_apply_without_sources() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("empty.toml");
        fs::write(&file, "").unwrap();

        let loaded = MigrationConfig::from_sources(Some(&file), env(&[])).unwrap();
        assert_eq!(loaded.store_path, "drive");
        assert_eq!(loaded.options(), MigrationOptions::default());
        assert_matches!(loaded.key_pair(), Err(ConfigError::Missing("key_pair_file")));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("drive-migrate.toml");
        fs::write(&file, "store_path = \"vault\"\npreview_words = 5\n").unwrap();

        let loaded = MigrationConfig::from_sources(
            Some(&file),
            env(&[
                ("DRIVE_MIGRATE__PREVIEW_WORDS", "8"),
                ("DRIVE_MIGRATE__CHECK_DISK_SPACE", "false"),
            ]),
        )
        .unwrap();
        assert_eq!(loaded.store_path, "vault");
        assert_eq!(loaded.preview_words, 8);
        assert!(!loaded.check_disk_space);
    }

    #[test]
    fn nested_store_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("c.toml");
        fs::write(&file, "store_path = \"a/b\"\n").unwrap();
        assert_matches!(
            MigrationConfig::from_sources(Some(&file), env(&[])),
            Err(ConfigError::Invalid { field: "store_path", .. })
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_matches!(
            MigrationConfig::from_sources(Some(&missing), env(&[])),
            Err(ConfigError::FileNotFound(_))
        );
    }

    #[test]
    fn key_material_loads_from_file_and_hex() {
        let dir = TempDir::new().unwrap();
        let pair = FeedKeyPair::generate();
        let key_file = dir.path().join("key.json");
        fs::write(&key_file, serde_json::to_vec(&pair).unwrap()).unwrap();

        let loaded = MigrationConfig {
            key_pair_file: Some(key_file),
            encryption_key: Some("ab".repeat(32)),
            ..Default::default()
        };
        assert_eq!(loaded.key_pair().unwrap(), pair);
        assert!(loaded.encryption_key().is_ok());

        let bad = MigrationConfig {
            encryption_key: Some("xyz".into()),
            ..Default::default()
        };
        assert_matches!(bad.encryption_key(), Err(ConfigError::EncryptionKey(_)));
    }
}
