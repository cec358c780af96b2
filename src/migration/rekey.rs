//! # Log Re-keyer (日志重建)
//!
//! 把旧存储 `Database/` 下的每个日志按新格式重建到暂存目录，签名密钥对保持逐字节一致。
//!
//! 新存储初始化时会预建占位日志，而日志文件不支持原地覆写，所以先删除同名占位文件
//! 再创建。任何一步失败都是致命错误：签名身份不允许降级。

use std::fs;
use std::path::Path;

use super::events::{EventReporter, MigrationPhase};
use super::{MigrationError, Result};
use crate::crypto::{ContentKey, FeedKeyPair};
use crate::feed::{Feed, FeedError, FeedFormat};
use crate::fs_common::log_and_skip_entry_err;
use crate::store::StoreError;

/// 重建完成的日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyedFeed {
    /// `Database/` 下的文件名
    pub name: String,
    /// 签名公钥（hex）
    pub public_key: String,
}

/// 旧存储日志目录中需要重建的文件：常规文件，跳过隐藏文件（如 `.DS_Store`），按名称排序
pub fn legacy_feed_names(legacy_db: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(legacy_db).map_err(|e| MigrationError::io(legacy_db, e))?;
    let mut names: Vec<String> = entries
        .filter_map(log_and_skip_entry_err)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

/// 重建全部日志
pub(crate) fn rekey_feeds(
    legacy_db: &Path,
    new_db: &Path,
    key: &ContentKey,
    reporter: &EventReporter<'_>,
) -> Result<Vec<RekeyedFeed>> {
    let names = legacy_feed_names(legacy_db)?;
    tracing::info!(
        "🔑 [Rekey] 开始重建 {} 个日志: {} -> {}",
        names.len(),
        legacy_db.display(),
        new_db.display()
    );

    let mut rebuilt = Vec::with_capacity(names.len());
    for name in names {
        let destination = new_db.join(&name);
        if destination.exists() {
            if let Err(e) = fs::remove_file(&destination) {
                reporter.warning(
                    MigrationPhase::Rekeying,
                    "placeholder_remove_failed",
                    format!("failed to remove placeholder log {}: {}", destination.display(), e),
                );
            }
        }

        let signer = rekey_feed(&legacy_db.join(&name), &destination, key).map_err(|e| match e {
            RekeyFailure::Store(source) => MigrationError::Rekey {
                feed: name.clone(),
                source,
            },
            RekeyFailure::Identity { expected, actual } => MigrationError::IdentityMismatch {
                feed: name.clone(),
                expected,
                actual,
            },
        })?;

        tracing::debug!("[Rekey] {} 已重建, 公钥 {}", name, signer.public_hex());
        rebuilt.push(RekeyedFeed {
            name,
            public_key: signer.public_hex(),
        });
    }

    reporter.info(
        MigrationPhase::Rekeying,
        "feeds_rekeyed",
        format!("rebuilt {} logs with their original signing keypairs", rebuilt.len()),
    );
    Ok(rebuilt)
}

pub(crate) enum RekeyFailure {
    Store(StoreError),
    Identity { expected: String, actual: String },
}

impl From<FeedError> for RekeyFailure {
    fn from(e: FeedError) -> Self {
        RekeyFailure::Store(StoreError::Feed(e))
    }
}

/// 重建单个日志，返回沿用的签名密钥对
pub(crate) fn rekey_feed(
    source: &Path,
    destination: &Path,
    key: &ContentKey,
) -> std::result::Result<FeedKeyPair, RekeyFailure> {
    let legacy = Feed::open(source, FeedFormat::Legacy, key)?;
    legacy.ready()?;
    let signer = legacy.signer().clone();
    legacy.close()?;

    let current = Feed::create(destination, FeedFormat::Current, &signer, key)?;
    current.ready()?;
    if current.signer() != &signer {
        return Err(RekeyFailure::Identity {
            expected: signer.public_hex(),
            actual: current.signer().public_hex(),
        });
    }
    current.close()?;
    Ok(signer)
}
