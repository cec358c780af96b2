//! # Store (存储协作接口)
//!
//! 迁移管线只通过这里的两个 trait 访问存储：
//!
//! - [`SourceStore`]：旧版存储的只读视图（三路日志流 + blob 读取）
//! - [`TargetStore`]：新版存储的写入视图（集合插入、索引、meta/local 直写）
//!
//! `legacy` 与 `drive` 是两者基于本地文件的参考实现。

pub mod collection;
pub mod drive;
pub mod legacy;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::CryptoError;
use crate::feed::{FeedError, LogRecord};

pub use drive::Drive;
pub use legacy::{LegacyDrive, LegacyDriveWriter};

/// 日志目录名
pub const DATABASE_DIR: &str = "Database";
/// blob 目录名
pub const FILES_DIR: &str = "Files";
/// 文件元数据所在的子集合名
pub const FILE_COLLECTION: &str = "file";

/// 旧版存储中的三路源日志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// 主日志（领域记录，带子集合标签）
    Main,
    /// 元数据日志
    Meta,
    /// 本地（不复制）键值日志
    Local,
}

impl LogSource {
    pub const ALL: [LogSource; 3] = [LogSource::Main, LogSource::Meta, LogSource::Local];

    /// 日志在 `Database/` 下的文件名
    pub fn file_name(&self) -> &'static str {
        match self {
            LogSource::Main => "main",
            LogSource::Meta => "meta",
            LogSource::Local => "local",
        }
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// 存储层错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid name '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidName(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("decrypt failed for {path}: {source}")]
    Decrypt {
        path: String,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store identity mismatch: {0}")]
    Identity(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 单路日志的阻塞式记录流
pub type RecordStream = Box<dyn Iterator<Item = Result<LogRecord, FeedError>> + Send>;

/// 旧版存储的只读视图
pub trait SourceStore: Send + Sync {
    /// 打开一路日志的读取流（每次调用返回独立的流）
    fn open_stream(&self, source: LogSource) -> StoreResult<RecordStream>;

    /// 读取并解密逻辑路径对应的文件内容
    fn read_file(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// 逻辑路径对应的 blob 在磁盘上的位置；不存在时返回 `None`
    fn blob_path(&self, path: &str) -> Option<PathBuf>;
}

/// 新版存储的写入视图
pub trait TargetStore {
    /// 打开集合（不存在则创建）
    fn open_collection(&mut self, name: &str) -> StoreResult<()>;

    /// 插入文档，返回生成的文档 id
    fn insert(&mut self, collection: &str, doc: &Value) -> StoreResult<String>;

    /// 把文档的指定字段加入全文索引
    fn fts_index(
        &mut self,
        collection: &str,
        fields: &[&str],
        doc_id: &str,
        doc: &Value,
    ) -> StoreResult<()>;

    /// 创建有序二级索引
    fn create_index(&mut self, collection: &str, fields: &[&str]) -> StoreResult<()>;

    /// 元数据日志直写
    fn meta_put(&mut self, key: &str, value: &Value) -> StoreResult<()>;

    /// 本地日志直写
    fn local_put(&mut self, key: &str, value: &Value) -> StoreResult<()>;
}

/// blob 逻辑路径 → `Files/` 下的相对路径（去掉前导 `/`，拒绝 `..`）
pub(crate) fn blob_relative_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let relative = PathBuf::from(trimmed);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)));
    (!escapes).then_some(relative)
}

/// 名称是否可以直接用作 `Files/` 下的单层文件名（blob 的稳定 id）
pub(crate) fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// 名称是否可以直接拼入 SQL 标识符（集合名、字段名）
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths_stay_inside_files_dir() {
        assert_eq!(blob_relative_path("/index.js"), Some(PathBuf::from("index.js")));
        assert_eq!(
            blob_relative_path("email/e1.json"),
            Some(PathBuf::from("email/e1.json"))
        );
        assert_eq!(blob_relative_path("/../etc/passwd"), None);
        assert_eq!(blob_relative_path("/"), None);
    }

    #[test]
    fn plain_names() {
        assert!(is_plain_name("AliasNamespace"));
        assert!(is_plain_name("created_at"));
        assert!(!is_plain_name("a'b"));
        assert!(!is_plain_name(""));
    }

    #[test]
    fn safe_file_names() {
        assert!(is_safe_file_name("5f0c7c4e-9d7b-4c1e-8a57-0d3f2b1e9a10"));
        assert!(is_safe_file_name("index.js"));
        assert!(!is_safe_file_name(".."));
        assert!(!is_safe_file_name("a/b"));
        assert!(!is_safe_file_name(""));
    }

    #[test]
    fn log_sources_have_stable_file_names() {
        let names: Vec<&str> = LogSource::ALL.iter().map(|s| s.file_name()).collect();
        assert_eq!(names, vec!["main", "meta", "local"]);
    }
}
