//! # Finalizer (收尾与目录交换)
//!
//! 加载完成后依次执行：
//!
//! 1. 把存活的 blob 逐字节复制到 `<staging>/Files/` 下（文件记录按稳定 id，
//!    meta 与邮件引用的 blob 按显示路径；旧存储保持原样）
//! 2. `<store>` → `<store>_old`，`<staging>` → `<store>`
//! 3. 删除 `<store>_old/migrate/data.json` 检查点
//!
//! 两次 rename 之间不是原子的，所以每一步之前都把进度写入交换标记
//! `<root>/.<store>.migration.json`（原子替换）。进程在交换途中退出后，
//! [`authoritative_store`] 根据标记给出哪个目录持有权威数据。

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{EventReporter, MigrationPhase};
use super::snapshot::Checkpoint;
use super::transformer::BlobMove;
use super::{MigrationError, Result, StoreLayout};
use crate::fs_common::{atomic_write, copy_file_synced, sync_dir};
use crate::store::FILES_DIR;

/// 交换进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    /// 暂存目录已加载完毕，尚未动 blob
    Prepared,
    /// blob 已复制到暂存目录
    BlobsCopied,
    /// 旧存储已改名为 `<store>_old`，新存储尚未就位
    LegacyRetired,
    /// 新存储已就位
    Promoted,
    /// 检查点已清理
    Completed,
}

impl SwapPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapPhase::Prepared => "prepared",
            SwapPhase::BlobsCopied => "blobs_copied",
            SwapPhase::LegacyRetired => "legacy_retired",
            SwapPhase::Promoted => "promoted",
            SwapPhase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交换标记文件内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapMarker {
    pub store: String,
    pub staging: String,
    pub retired: String,
    pub phase: SwapPhase,
    pub updated_at: DateTime<Utc>,
}

impl SwapMarker {
    fn for_layout(layout: &StoreLayout, phase: SwapPhase) -> Self {
        Self {
            store: layout.store_name.clone(),
            staging: layout.staging_name.clone(),
            retired: format!("{}{}", layout.store_name, super::RETIRED_SUFFIX),
            phase,
            updated_at: Utc::now(),
        }
    }

    /// 读取标记；文件不存在时返回 `None`
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(|e| MigrationError::io(path, e))?;
        let marker = serde_json::from_slice(&bytes).map_err(|e| MigrationError::Checkpoint {
            path: path.to_path_buf(),
            reason: format!("unreadable swap marker: {}", e),
        })?;
        Ok(Some(marker))
    }

    fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| MigrationError::Checkpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        atomic_write(path, &bytes).map_err(|e| MigrationError::io(path, e))
    }
}

/// 根据交换标记判断权威存储目录
///
/// - 无标记、`prepared`、`blobs_copied`：旧存储仍在 `<store>`
/// - `legacy_retired`：`<store>` 不存在，新存储仍在暂存目录
/// - `promoted`、`completed`：新存储已在 `<store>`
pub fn authoritative_store(root: &Path, store: &str) -> Result<PathBuf> {
    let layout = StoreLayout::new(root, store);
    let Some(marker) = SwapMarker::load(&layout.marker_path())? else {
        return Ok(layout.legacy_dir());
    };
    Ok(match marker.phase {
        SwapPhase::Prepared | SwapPhase::BlobsCopied => layout.legacy_dir(),
        SwapPhase::LegacyRetired => root.join(&marker.staging),
        SwapPhase::Promoted | SwapPhase::Completed => layout.legacy_dir(),
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FinalizeStats {
    pub blobs_copied: usize,
    pub bytes_copied: u64,
    /// 非致命的清理失败数
    pub cleanup_warnings: usize,
}

pub(crate) struct Finalizer<'a> {
    layout: &'a StoreLayout,
    reporter: &'a EventReporter<'a>,
}

impl<'a> Finalizer<'a> {
    pub(crate) fn new(layout: &'a StoreLayout, reporter: &'a EventReporter<'a>) -> Self {
        Self { layout, reporter }
    }

    fn mark(&self, phase: SwapPhase) -> Result<()> {
        SwapMarker::for_layout(self.layout, phase).write(&self.layout.marker_path())?;
        tracing::debug!("[Finalizer] 交换标记 -> {}", phase);
        Ok(())
    }

    pub(crate) fn finalize(&self, blob_moves: &[BlobMove]) -> Result<FinalizeStats> {
        let mut stats = FinalizeStats::default();
        let staging = self.layout.staging_dir();
        let legacy = self.layout.legacy_dir();
        let retired = self.layout.retired_dir();

        self.mark(SwapPhase::Prepared)?;

        let files_dir = staging.join(FILES_DIR);
        fs::create_dir_all(&files_dir).map_err(|e| MigrationError::io(&files_dir, e))?;
        for blob in blob_moves {
            let destination = files_dir.join(&blob.target);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| MigrationError::io(parent, e))?;
            }
            let bytes = copy_file_synced(&blob.source, &destination)
                .map_err(|e| MigrationError::io(&blob.source, e))?;
            stats.blobs_copied += 1;
            stats.bytes_copied += bytes;
        }
        sync_dir(&files_dir);
        self.reporter.info(
            MigrationPhase::Finalization,
            "blobs_copied",
            format!(
                "copied {} blobs ({} bytes) into the new store",
                stats.blobs_copied, stats.bytes_copied
            ),
        );
        self.mark(SwapPhase::BlobsCopied)?;

        fs::rename(&legacy, &retired).map_err(|e| MigrationError::io(&legacy, e))?;
        self.mark(SwapPhase::LegacyRetired)?;

        fs::rename(&staging, &legacy).map_err(|e| MigrationError::io(&staging, e))?;
        sync_dir(&self.layout.root);
        self.mark(SwapPhase::Promoted)?;
        tracing::info!(
            "[Finalizer] 目录交换完成: {} -> {}, {} -> {}",
            legacy.display(),
            retired.display(),
            staging.display(),
            legacy.display()
        );

        let checkpoint = Checkpoint::in_store(&retired);
        if checkpoint.exists() {
            if let Err(e) = checkpoint.remove() {
                stats.cleanup_warnings += 1;
                self.reporter.warning(
                    MigrationPhase::Finalization,
                    "checkpoint_cleanup_failed",
                    format!(
                        "failed to remove checkpoint {}: {}",
                        checkpoint.path().display(),
                        e
                    ),
                );
            }
        }
        self.mark(SwapPhase::Completed)?;

        let marker = self.layout.marker_path();
        if let Err(e) = fs::remove_file(&marker) {
            stats.cleanup_warnings += 1;
            self.reporter.warning(
                MigrationPhase::Finalization,
                "marker_cleanup_failed",
                format!("failed to remove swap marker {}: {}", marker.display(), e),
            );
        }
        Ok(stats)
    }
}
