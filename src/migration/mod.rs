//! # Migration 模块
//!
//! 把旧版（format 1）存储迁移为新版（format 2）存储，保持每个日志的签名身份不变。
//!
//! ## 阶段
//!
//! 严格按顺序执行，任一致命错误立即中止，旧存储保持原样：
//!
//! 1. `extractor`：三路日志流并发抽取为快照，每路结束后写检查点
//! 2. `rekey`：按旧日志头中的签名密钥对重建新格式日志
//! 3. `transformer`：按版本化的集合策略表转换记录
//! 4. `loader`：写入新存储（集合插入、全文索引、有序索引、meta/local 直写）
//! 5. `finalizer`：复制 blob、交换目录、清理检查点
//!
//! ## 组件
//!
//! - `pipeline`: 编排器（前置检查 + 阶段驱动 + 报告）
//! - `events`: 结构化事件通道
//! - `snapshot`: 快照与检查点读写
//! - `policy`: 集合策略表
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use drive_migrate::migration::{MigrationPipeline, MigrationRequest};
//!
//! let report = MigrationPipeline::new(request).run().await?;
//! println!("inserted {} records", report.records_inserted);
//! ```

pub mod events;
pub mod extractor;
pub mod finalizer;
pub mod loader;
pub mod pipeline;
pub mod policy;
pub mod rekey;
pub mod snapshot;
pub mod transformer;

use std::path::{Path, PathBuf};

use crate::feed::FeedError;
use crate::store::{LogSource, StoreError};

pub use events::{
    ChannelSink, CollectingSink, EventLevel, MigrationEvent, MigrationEventSink, MigrationPhase,
    NoopSink,
};
pub use finalizer::{authoritative_store, SwapMarker, SwapPhase};
pub use pipeline::{MigrationOptions, MigrationPipeline, MigrationReport, MigrationRequest};
pub use policy::{CollectionPolicy, PolicyTable, RecordPolicy, SchemaVersion};
pub use snapshot::Snapshot;

/// 新存储的暂存目录名（相对于根目录）
pub const DEFAULT_STAGING_DIR: &str = "drive_new";
/// 交换后旧存储目录名的后缀
pub const RETIRED_SUFFIX: &str = "_old";

/// 一次迁移涉及的全部目录
#[derive(Debug, Clone)]
pub struct StoreLayout {
    /// 根目录
    pub root: PathBuf,
    /// 存储目录名（相对于根目录）
    pub store_name: String,
    /// 暂存目录名（相对于根目录）
    pub staging_name: String,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>, store_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            store_name: store_name.into(),
            staging_name: DEFAULT_STAGING_DIR.to_string(),
        }
    }

    pub fn with_staging_name(mut self, staging_name: impl Into<String>) -> Self {
        self.staging_name = staging_name.into();
        self
    }

    /// `<root>/<store>`
    pub fn legacy_dir(&self) -> PathBuf {
        self.root.join(&self.store_name)
    }

    /// `<root>/drive_new`
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(&self.staging_name)
    }

    /// `<root>/<store>_old`
    pub fn retired_dir(&self) -> PathBuf {
        self.root
            .join(format!("{}{}", self.store_name, RETIRED_SUFFIX))
    }

    /// `<root>/.<store>.migration.json`
    pub fn marker_path(&self) -> PathBuf {
        self.root
            .join(format!(".{}.migration.json", self.store_name))
    }

    /// 检查点文件：`<dir>/migrate/data.json`
    pub fn checkpoint_in(dir: &Path) -> PathBuf {
        dir.join(crate::store::legacy::MIGRATE_DIR)
            .join(snapshot::CHECKPOINT_FILE)
    }
}

/// 迁移错误
///
/// 这里的每个变体都是致命错误；非致命问题以 warning 事件上报并计入报告。
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Extraction of '{source_log}' failed: {reason}")]
    Extraction { source_log: LogSource, reason: String },

    #[error("Snapshot is incomplete; sources not drained: {0:?}")]
    IncompleteSnapshot(Vec<LogSource>),

    #[error("Re-keying feed '{feed}' failed: {source}")]
    Rekey {
        feed: String,
        #[source]
        source: StoreError,
    },

    #[error("Feed '{feed}' identity changed during re-keying: {expected} -> {actual}")]
    IdentityMismatch {
        feed: String,
        expected: String,
        actual: String,
    },

    #[error("Store at {0} is already in the current format")]
    AlreadyMigrated(PathBuf),

    #[error("Legacy store not found at {0}")]
    LegacyMissing(PathBuf),

    #[error("Staging directory {0} already exists; remove it before migrating")]
    StagingExists(PathBuf),

    #[error("Retired store directory {0} already exists; remove it before migrating")]
    RetiredExists(PathBuf),

    #[error("An interrupted swap was found (marker {path}, phase {phase}); recover manually")]
    InterruptedSwap { path: PathBuf, phase: String },

    #[error("Supplied keypair {supplied} does not sign the main log (signed by {actual})")]
    KeyPairMismatch { supplied: String, actual: String },

    #[error("Insufficient disk space: {available_mb}MB available, need at least {required_mb}MB. Please free up disk space and retry.")]
    InsufficientDiskSpace { available_mb: u64, required_mb: u64 },

    #[error("Cannot determine free disk space at {path}: {reason}. Disable the disk check only if the volume is known to have room.")]
    DiskSpaceUnknown { path: PathBuf, reason: String },

    #[error("Checkpoint error at {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("Unsupported store format version {0}")]
    UnsupportedVersion(u8),

    #[error("Extraction task failed: {0}")]
    Task(String),
}

impl MigrationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrationError::Io {
            path: path.into(),
            source,
        }
    }

    /// 事件代码（稳定的机器可读标识）
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::Io { .. } => "io",
            MigrationError::Store(_) => "store",
            MigrationError::Feed(_) => "feed",
            MigrationError::Extraction { .. } => "extraction",
            MigrationError::IncompleteSnapshot(_) => "incomplete_snapshot",
            MigrationError::Rekey { .. } => "rekey",
            MigrationError::IdentityMismatch { .. } => "identity_mismatch",
            MigrationError::AlreadyMigrated(_) => "already_migrated",
            MigrationError::LegacyMissing(_) => "legacy_missing",
            MigrationError::StagingExists(_) => "staging_exists",
            MigrationError::RetiredExists(_) => "retired_exists",
            MigrationError::InterruptedSwap { .. } => "interrupted_swap",
            MigrationError::KeyPairMismatch { .. } => "keypair_mismatch",
            MigrationError::InsufficientDiskSpace { .. } => "insufficient_disk_space",
            MigrationError::DiskSpaceUnknown { .. } => "disk_space_unknown",
            MigrationError::Checkpoint { .. } => "checkpoint",
            MigrationError::UnsupportedVersion(_) => "unsupported_version",
            MigrationError::Task(_) => "task",
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_follow_store_name() {
        let layout = StoreLayout::new("/data", "drive");
        assert_eq!(layout.legacy_dir(), PathBuf::from("/data/drive"));
        assert_eq!(layout.staging_dir(), PathBuf::from("/data/drive_new"));
        assert_eq!(layout.retired_dir(), PathBuf::from("/data/drive_old"));
        assert_eq!(
            layout.marker_path(),
            PathBuf::from("/data/.drive.migration.json")
        );
        assert_eq!(
            StoreLayout::checkpoint_in(&layout.retired_dir()),
            PathBuf::from("/data/drive_old/migrate/data.json")
        );
    }

    #[test]
    fn staging_name_is_configurable() {
        let layout = StoreLayout::new("/data", "drive").with_staging_name("staging");
        assert_eq!(layout.staging_dir(), PathBuf::from("/data/staging"));
    }

    #[test]
    fn error_codes_are_stable() {
        let err = MigrationError::InsufficientDiskSpace {
            available_mb: 1,
            required_mb: 2,
        };
        assert_eq!(err.code(), "insufficient_disk_space");
        assert!(err.to_string().contains("1MB available"));
    }
}
