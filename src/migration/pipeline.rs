//! # Migration Pipeline (迁移编排器)
//!
//! 前置检查通过后严格按顺序驱动各阶段：
//!
//! ```text
//! Preflight → Extract → Rekey → Transform → Load → Finalize
//! ```
//!
//! 任一阶段返回致命错误即中止：发出 `fatal` 事件并把错误返回给调用方。
//! 不做回滚，旧存储与暂存目录都保留在磁盘上。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::events::{EventReporter, MigrationEventSink, MigrationPhase, NoopSink};
use super::extractor::{Extractor, DEFAULT_CHANNEL_CAPACITY};
use super::finalizer::{Finalizer, SwapMarker};
use super::loader::Loader;
use super::policy::{PolicyTable, SchemaVersion};
use super::rekey::rekey_feeds;
use super::snapshot::{Checkpoint, Snapshot};
use super::transformer::{Transformer, DEFAULT_PREVIEW_WORDS};
use super::{MigrationError, Result, StoreLayout, DEFAULT_STAGING_DIR};
use crate::crypto::{ContentKey, FeedKeyPair};
use crate::feed::{read_format_version, FeedFormat};
use crate::fs_common::{dir_size, get_available_disk_space};
use crate::store::{Drive, LegacyDrive, LogSource, SourceStore, DATABASE_DIR};

/// 空间预检的默认余量（MB）
pub const DEFAULT_DISK_MARGIN_MB: u64 = 50;

/// 一次迁移的输入
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    /// 存储所在的根目录
    pub root_dir: PathBuf,
    /// 存储目录名（相对于根目录）
    pub store_path: String,
    /// main 日志的签名密钥对
    pub key_pair: FeedKeyPair,
    /// 内容加密密钥
    pub encryption_key: ContentKey,
    /// 预置快照（作为抽取的初始累加器）
    pub seed: Option<Snapshot>,
}

/// 可调参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub staging_dir: String,
    pub preview_words: usize,
    pub channel_capacity: usize,
    pub check_disk_space: bool,
    pub disk_margin_mb: u64,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            preview_words: DEFAULT_PREVIEW_WORDS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            check_disk_space: true,
            disk_margin_mb: DEFAULT_DISK_MARGIN_MB,
        }
    }
}

/// 迁移报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    /// 迁移后新存储所在目录
    pub store_dir: PathBuf,
    /// 保留的旧存储目录
    pub retired_dir: PathBuf,
    pub resumed_from_checkpoint: bool,
    pub records_read: usize,
    /// meta 中引用但缺失的 blob 数
    pub meta_blobs_missing: usize,
    pub feeds_rekeyed: Vec<String>,
    pub records_emitted: usize,
    pub records_inserted: usize,
    pub insert_failures: usize,
    pub index_failures: usize,
    pub invalid_dropped: usize,
    pub files_skipped: usize,
    pub meta_entries: usize,
    pub local_entries: usize,
    /// 其中按显示路径搬迁的（meta 引用与邮件）
    pub blobs_relocated: usize,
    pub blobs_copied: usize,
    pub bytes_copied: u64,
    /// 上报的 warning 事件总数
    pub warnings: usize,
    pub total_duration_ms: u64,
}

/// 迁移编排器
pub struct MigrationPipeline {
    request: MigrationRequest,
    options: MigrationOptions,
    sink: Arc<dyn MigrationEventSink>,
}

impl MigrationPipeline {
    pub fn new(request: MigrationRequest) -> Self {
        Self {
            request,
            options: MigrationOptions::default(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn MigrationEventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn layout(&self) -> StoreLayout {
        StoreLayout::new(&self.request.root_dir, &self.request.store_path)
            .with_staging_name(&self.options.staging_dir)
    }

    /// 执行迁移
    pub async fn run(self) -> Result<MigrationReport> {
        let start = Instant::now();
        let reporter = EventReporter::new(self.sink.as_ref());
        let layout = self.layout();
        let mut phase = MigrationPhase::Preflight;

        tracing::info!(
            "🚀 [MigrationPipeline] 开始迁移存储: {}",
            layout.legacy_dir().display()
        );

        match self.execute(&layout, &reporter, &mut phase).await {
            Ok(mut report) => {
                report.success = true;
                report.warnings = reporter.warning_count();
                report.total_duration_ms = start.elapsed().as_millis() as u64;
                reporter.info(
                    MigrationPhase::Completed,
                    "migration_completed",
                    format!(
                        "migrated {} records with {} warnings in {}ms",
                        report.records_inserted, report.warnings, report.total_duration_ms
                    ),
                );
                tracing::info!(
                    "🏁 [MigrationPipeline] 迁移完成: 新存储 {}, 旧存储保留于 {}",
                    report.store_dir.display(),
                    report.retired_dir.display()
                );
                Ok(report)
            }
            Err(e) => {
                reporter.fatal(phase, e.code(), e.to_string());
                tracing::error!(
                    failed_phase = phase.as_str(),
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "❌ [MigrationPipeline] 迁移中止，旧存储保持原样"
                );
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        layout: &StoreLayout,
        reporter: &EventReporter<'_>,
        phase: &mut MigrationPhase,
    ) -> Result<MigrationReport> {
        let key = &self.request.encryption_key;
        let mut report = MigrationReport {
            store_dir: layout.legacy_dir(),
            retired_dir: layout.retired_dir(),
            ..Default::default()
        };

        let (legacy, version) = self.preflight(layout, reporter)?;
        let legacy = Arc::new(legacy);

        *phase = MigrationPhase::Extraction;
        let source: Arc<dyn SourceStore> = legacy.clone();
        let outcome = Extractor::new(source, Checkpoint::in_store(&layout.legacy_dir()), reporter)
            .with_channel_capacity(self.options.channel_capacity)
            .extract(self.request.seed.clone())
            .await?;
        report.resumed_from_checkpoint = outcome.resumed;
        report.records_read = outcome.records_read;
        report.meta_blobs_missing = outcome.missing_meta_blobs;
        let snapshot = outcome.snapshot;

        *phase = MigrationPhase::Rekeying;
        let staging = layout.staging_dir();
        Drive::init_layout(&staging, key)?;
        let rekeyed = rekey_feeds(
            &legacy.database_dir(),
            &staging.join(DATABASE_DIR),
            key,
            reporter,
        )?;
        report.feeds_rekeyed = rekeyed.into_iter().map(|f| f.name).collect();

        *phase = MigrationPhase::Transformation;
        let output = Transformer::new(legacy.as_ref(), PolicyTable::for_version(version), reporter)
            .with_preview_words(self.options.preview_words)
            .transform(&snapshot)?;
        report.records_emitted = output.stats.emitted;
        report.invalid_dropped = output.stats.invalid_dropped;
        report.files_skipped = output.stats.deleted_files
            + output.stats.tombstoned
            + output.stats.backup_skipped
            + output.stats.unsafe_ids
            + output.stats.duplicate_ids
            + output.stats.missing_blobs;
        report.blobs_relocated = output.stats.relocated_blobs;

        *phase = MigrationPhase::Loading;
        let mut drive = Drive::open(&staging, &self.request.key_pair, key)?;
        let loaded = Loader::new(&mut drive, reporter).load(&snapshot, &output)?;
        drive.close()?;
        report.records_inserted = loaded.inserted;
        report.insert_failures = loaded.insert_failures;
        report.index_failures = loaded.index_failures;
        report.meta_entries = loaded.meta_written;
        report.local_entries = loaded.local_written;

        *phase = MigrationPhase::Finalization;
        let finalized = Finalizer::new(layout, reporter).finalize(&output.blob_moves)?;
        report.blobs_copied = finalized.blobs_copied;
        report.bytes_copied = finalized.bytes_copied;

        *phase = MigrationPhase::Completed;
        Ok(report)
    }

    /// 前置检查：任何一项不通过都不会触碰磁盘
    fn preflight(
        &self,
        layout: &StoreLayout,
        reporter: &EventReporter<'_>,
    ) -> Result<(LegacyDrive, SchemaVersion)> {
        let legacy_dir = layout.legacy_dir();
        if !legacy_dir.is_dir() {
            return Err(MigrationError::LegacyMissing(legacy_dir));
        }

        if let Some(marker) = SwapMarker::load(&layout.marker_path())? {
            return Err(MigrationError::InterruptedSwap {
                path: layout.marker_path(),
                phase: marker.phase.to_string(),
            });
        }

        let main_log = legacy_dir
            .join(DATABASE_DIR)
            .join(LogSource::Main.file_name());
        let format = read_format_version(&main_log)?;
        let version = match SchemaVersion::from_format_version(format) {
            Some(version) => version,
            None if format == FeedFormat::Current.version() => {
                return Err(MigrationError::AlreadyMigrated(legacy_dir));
            }
            None => return Err(MigrationError::UnsupportedVersion(format)),
        };

        if layout.staging_dir().exists() {
            return Err(MigrationError::StagingExists(layout.staging_dir()));
        }
        if layout.retired_dir().exists() {
            return Err(MigrationError::RetiredExists(layout.retired_dir()));
        }

        let legacy = LegacyDrive::open(&legacy_dir, &self.request.encryption_key)?;
        let signer = legacy.signer(LogSource::Main)?;
        if signer != self.request.key_pair {
            return Err(MigrationError::KeyPairMismatch {
                supplied: self.request.key_pair.public_hex(),
                actual: signer.public_hex(),
            });
        }

        if self.options.check_disk_space {
            self.preflight_disk_space_check(layout)?;
        }

        reporter.info(
            MigrationPhase::Preflight,
            "preflight_passed",
            format!("legacy store {} is ready to migrate", legacy_dir.display()),
        );
        Ok((legacy, version))
    }

    /// 需要的空间 = 旧存储大小 * 2 + 余量
    fn preflight_disk_space_check(&self, layout: &StoreLayout) -> Result<()> {
        let store_size = dir_size(&layout.legacy_dir());
        check_disk_budget(
            &layout.root,
            store_size,
            self.options.disk_margin_mb,
            get_available_disk_space(&layout.root),
        )
    }
}

/// 可用空间无法读取时中止迁移，不做乐观假设
fn check_disk_budget(
    root: &Path,
    store_size: u64,
    margin_mb: u64,
    available: io::Result<u64>,
) -> Result<()> {
    let margin_bytes = margin_mb.saturating_mul(1024 * 1024);
    let required_bytes = store_size.saturating_mul(2).saturating_add(margin_bytes);
    let required_mb = required_bytes / (1024 * 1024);

    let available = match available {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(
                path = %root.display(),
                error = %e,
                required_mb = required_mb,
                "无法获取磁盘可用空间，为确保数据安全，迁移已中止"
            );
            return Err(MigrationError::DiskSpaceUnknown {
                path: root.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    let available_mb = available / (1024 * 1024);

    if available < required_bytes {
        tracing::error!(
            available_mb = available_mb,
            required_mb = required_mb,
            store_size_mb = store_size / (1024 * 1024),
            "磁盘空间不足，无法安全执行迁移"
        );
        return Err(MigrationError::InsufficientDiskSpace {
            available_mb,
            required_mb,
        });
    }

    tracing::debug!(
        available_mb = available_mb,
        required_mb = required_mb,
        "磁盘空间预检查通过"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::events::{CollectingSink, EventLevel};
    use crate::store::LegacyDriveWriter;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn legacy_store(root: &std::path::Path) -> (FeedKeyPair, ContentKey) {
        let pair = FeedKeyPair::generate();
        let key = ContentKey::generate();
        let mut writer = LegacyDriveWriter::create(&root.join("drive"), &pair, &key).unwrap();
        writer.put("Contact", "c1", json!({"name": "ann"})).unwrap();
        writer.close().unwrap();
        (pair, key)
    }

    fn request(root: &std::path::Path, pair: FeedKeyPair, key: ContentKey) -> MigrationRequest {
        MigrationRequest {
            root_dir: root.to_path_buf(),
            store_path: "drive".into(),
            key_pair: pair,
            encryption_key: key,
            seed: None,
        }
    }

    #[tokio::test]
    async fn missing_store_is_reported_as_fatal() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(CollectingSink::new());
        let result = MigrationPipeline::new(request(
            tmp.path(),
            FeedKeyPair::generate(),
            ContentKey::generate(),
        ))
        .with_event_sink(sink.clone())
        .run()
        .await;

        assert_matches!(result, Err(MigrationError::LegacyMissing(_)));
        let fatal = sink.with_level(EventLevel::Fatal);
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].phase, MigrationPhase::Preflight);
        assert_eq!(fatal[0].code, "legacy_missing");
    }

    #[tokio::test]
    async fn wrong_keypair_is_rejected_before_any_write() {
        let tmp = TempDir::new().unwrap();
        let (_pair, key) = legacy_store(tmp.path());

        let result = MigrationPipeline::new(request(tmp.path(), FeedKeyPair::generate(), key))
            .run()
            .await;
        assert_matches!(result, Err(MigrationError::KeyPairMismatch { .. }));
        assert!(!tmp.path().join("drive_new").exists());
        assert!(!tmp.path().join("drive/migrate/data.json").exists());
    }

    #[tokio::test]
    async fn existing_staging_dir_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (pair, key) = legacy_store(tmp.path());
        std::fs::create_dir_all(tmp.path().join("drive_new")).unwrap();

        let result = MigrationPipeline::new(request(tmp.path(), pair, key)).run().await;
        assert_matches!(result, Err(MigrationError::StagingExists(_)));
    }

    #[tokio::test]
    async fn impossible_disk_margin_fails_preflight() {
        let tmp = TempDir::new().unwrap();
        let (pair, key) = legacy_store(tmp.path());
        let options = MigrationOptions {
            disk_margin_mb: u64::MAX / (1024 * 1024),
            ..Default::default()
        };

        let result = MigrationPipeline::new(request(tmp.path(), pair, key))
            .with_options(options)
            .run()
            .await;
        assert_matches!(result, Err(MigrationError::InsufficientDiskSpace { .. }));
    }

    #[tokio::test]
    async fn staging_dir_name_is_configurable() {
        let tmp = TempDir::new().unwrap();
        let (pair, key) = legacy_store(tmp.path());
        let options = MigrationOptions {
            staging_dir: "staging".into(),
            check_disk_space: false,
            ..Default::default()
        };

        let report = MigrationPipeline::new(request(tmp.path(), pair, key))
            .with_options(options)
            .run()
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.records_inserted, 1);
        assert!(!tmp.path().join("staging").exists());
        assert!(tmp.path().join("drive_old").is_dir());
    }

    #[test]
    fn unreadable_free_space_blocks_the_run() {
        let root = std::path::Path::new("/srv/data");
        let unknown = Err(io::Error::new(io::ErrorKind::PermissionDenied, "statvfs denied"));
        assert_matches!(
            check_disk_budget(root, 10, 50, unknown),
            Err(MigrationError::DiskSpaceUnknown { ref path, .. }) if path == root
        );

        let mb = 1024 * 1024;
        assert!(check_disk_budget(root, 10 * mb, 50, Ok(70 * mb)).is_ok());
        assert_matches!(
            check_disk_budget(root, 10 * mb, 50, Ok(69 * mb)),
            Err(MigrationError::InsufficientDiskSpace {
                available_mb: 69,
                required_mb: 70
            })
        );
    }
}
