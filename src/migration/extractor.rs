//! # Snapshot Extractor (快照抽取)
//!
//! 三路日志（main / meta / local）各由一个阻塞任务读取，经有界通道汇入唯一的消费者。
//! 消费者独占 [`Snapshot`]：按标签归入集合桶或事务列表，meta/local 按键合并。
//!
//! 每路日志读到结尾后立即写检查点并累加完成计数，计数达到 3 才返回。
//! 任一路出现无法解析的记录即中止抽取。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{EventReporter, MigrationPhase};
use super::policy::LEGACY_BACKUP_PATH;
use super::snapshot::{Checkpoint, Snapshot};
use super::{MigrationError, Result};
use crate::feed::LogRecord;
use crate::store::{LogSource, SourceStore};

/// 需要读到结尾的日志数
pub const EXPECTED_SOURCES: usize = 3;
/// 默认通道容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

enum ExtractEvent {
    Record(LogSource, LogRecord),
    End(LogSource),
    Failed(LogSource, String),
}

/// 抽取结果
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub snapshot: Snapshot,
    /// 是否直接沿用了完整的检查点
    pub resumed: bool,
    /// 本次读取的记录数（沿用检查点时为 0）
    pub records_read: usize,
    /// meta 中引用但磁盘上不存在的 blob 数
    pub missing_meta_blobs: usize,
}

/// 快照抽取器
pub struct Extractor<'a> {
    source: Arc<dyn SourceStore>,
    checkpoint: Checkpoint,
    channel_capacity: usize,
    reporter: &'a EventReporter<'a>,
}

impl<'a> Extractor<'a> {
    pub(crate) fn new(
        source: Arc<dyn SourceStore>,
        checkpoint: Checkpoint,
        reporter: &'a EventReporter<'a>,
    ) -> Self {
        Self {
            source,
            checkpoint,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reporter,
        }
    }

    pub(crate) fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// 沿用完整的检查点；不完整或无法读取的检查点被丢弃
    fn try_resume(&self) -> Option<Snapshot> {
        if !self.checkpoint.exists() {
            return None;
        }
        match self.checkpoint.load() {
            Ok(snapshot) if snapshot.is_complete() => {
                self.reporter.info(
                    MigrationPhase::Extraction,
                    "checkpoint_resumed",
                    format!(
                        "resuming from complete checkpoint {}",
                        self.checkpoint.path().display()
                    ),
                );
                Some(snapshot)
            }
            Ok(_) => {
                self.reporter.warning(
                    MigrationPhase::Extraction,
                    "checkpoint_incomplete",
                    "found an incomplete checkpoint, extracting again",
                );
                None
            }
            Err(e) => {
                self.reporter.warning(
                    MigrationPhase::Extraction,
                    "checkpoint_unreadable",
                    format!("ignoring unreadable checkpoint: {}", e),
                );
                None
            }
        }
    }

    /// 抽取快照；`seed` 作为初始累加器
    pub(crate) async fn extract(&self, seed: Option<Snapshot>) -> Result<ExtractionOutcome> {
        if let Some(snapshot) = self.try_resume() {
            return Ok(ExtractionOutcome {
                snapshot,
                resumed: true,
                records_read: 0,
                missing_meta_blobs: 0,
            });
        }

        let mut snapshot = seed.unwrap_or_default();
        snapshot.completed.clear();

        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let producers: Vec<JoinHandle<()>> = LogSource::ALL
            .iter()
            .map(|source| spawn_producer(Arc::clone(&self.source), *source, tx.clone()))
            .collect();
        drop(tx);

        let mut finished = 0usize;
        let mut records_read = 0usize;
        let mut missing_meta_blobs = 0usize;

        while finished < EXPECTED_SOURCES {
            match rx.recv().await {
                Some(ExtractEvent::Record(source, record)) => {
                    records_read += 1;
                    snapshot.route(source, record);
                }
                Some(ExtractEvent::End(source)) => {
                    if source == LogSource::Meta {
                        missing_meta_blobs = self.check_meta_blobs(&snapshot);
                    }
                    snapshot.mark_complete(source);
                    self.checkpoint.save(&snapshot)?;
                    finished += 1;
                    tracing::info!(
                        source = %source,
                        finished,
                        "[Extractor] {} 读取完成 ({}/{})",
                        source,
                        finished,
                        EXPECTED_SOURCES
                    );
                }
                Some(ExtractEvent::Failed(source, reason)) => {
                    return Err(MigrationError::Extraction {
                        source_log: source,
                        reason,
                    });
                }
                None => {
                    return Err(MigrationError::Task(format!(
                        "extraction channel closed after {} of {} sources",
                        finished, EXPECTED_SOURCES
                    )));
                }
            }
        }

        for producer in producers {
            producer
                .await
                .map_err(|e| MigrationError::Task(e.to_string()))?;
        }

        self.reporter.info(
            MigrationPhase::Extraction,
            "snapshot_extracted",
            format!(
                "extracted {} records ({} collection records, {} meta, {} local)",
                records_read,
                snapshot.collection_record_count(),
                snapshot.meta.len(),
                snapshot.local.len()
            ),
        );

        Ok(ExtractionOutcome {
            snapshot,
            resumed: false,
            records_read,
            missing_meta_blobs,
        })
    }

    /// meta 条目引用的 blob 缺失只告警
    fn check_meta_blobs(&self, snapshot: &Snapshot) -> usize {
        let mut missing = 0;
        for (key, value) in &snapshot.meta {
            let Some(path) = value.get("path").and_then(|p| p.as_str()) else {
                continue;
            };
            if path == LEGACY_BACKUP_PATH {
                continue;
            }
            if self.source.blob_path(path).is_none() {
                missing += 1;
                self.reporter.warning(
                    MigrationPhase::Extraction,
                    "meta_blob_missing",
                    format!("metadata entry '{}' references missing blob '{}'", key, path),
                );
            }
        }
        missing
    }
}

/// 在阻塞线程上读取一路日志；消费者提前退出时停止发送
fn spawn_producer(
    store: Arc<dyn SourceStore>,
    source: LogSource,
    tx: mpsc::Sender<ExtractEvent>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let stream = match store.open_stream(source) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.blocking_send(ExtractEvent::Failed(source, e.to_string()));
                return;
            }
        };
        for item in stream {
            let event = match item {
                Ok(record) => ExtractEvent::Record(source, record),
                Err(e) => {
                    let _ = tx.blocking_send(ExtractEvent::Failed(source, e.to_string()));
                    return;
                }
            };
            if tx.blocking_send(event).is_err() {
                return;
            }
        }
        let _ = tx.blocking_send(ExtractEvent::End(source));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentKey, FeedKeyPair};
    use crate::migration::events::CollectingSink;
    use crate::store::legacy::{LegacyDrive, LegacyDriveWriter};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn legacy_store(dir: &std::path::Path, key: &ContentKey) {
        let mut writer = LegacyDriveWriter::create(dir, &FeedKeyPair::generate(), key).unwrap();
        writer.put("Contact", "c1", json!({"name": "Ann"})).unwrap();
        writer.put("Contact", "c2", json!({"name": "Bo"})).unwrap();
        writer.put_raw("tx/1", json!({"op": "put"})).unwrap();
        writer.meta_put("theme", json!("light")).unwrap();
        writer.meta_put("theme", json!("dark")).unwrap();
        writer
            .meta_put("avatar", json!({"path": "/avatar.png"}))
            .unwrap();
        writer
            .meta_put("backup", json!({"path": LEGACY_BACKUP_PATH}))
            .unwrap();
        writer.local_put("cursor", json!(4)).unwrap();
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn drains_all_three_logs_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let key = ContentKey::generate();
        legacy_store(dir.path(), &key);

        let source: Arc<dyn SourceStore> = Arc::new(LegacyDrive::open(dir.path(), &key).unwrap());
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let checkpoint = Checkpoint::in_store(dir.path());
        let outcome = Extractor::new(source, checkpoint.clone(), &reporter)
            .with_channel_capacity(1)
            .extract(None)
            .await
            .unwrap();

        let snapshot = &outcome.snapshot;
        assert!(!outcome.resumed);
        assert_eq!(outcome.records_read, 8);
        assert_eq!(snapshot.main.collections["Contact"].len(), 2);
        assert_eq!(snapshot.main.tx.len(), 1);
        assert_eq!(snapshot.meta["theme"], json!("dark"));
        assert_eq!(snapshot.local["cursor"], json!(4));
        assert!(snapshot.is_complete());

        // 只有 avatar 告警，备份路径被忽略
        assert_eq!(outcome.missing_meta_blobs, 1);
        assert_eq!(checkpoint.load().unwrap(), *snapshot);
    }

    #[tokio::test]
    async fn complete_checkpoint_is_reused() {
        let dir = TempDir::new().unwrap();
        let key = ContentKey::generate();
        legacy_store(dir.path(), &key);

        let mut stored = Snapshot::new();
        stored.meta.insert("from".into(), json!("checkpoint"));
        for source in LogSource::ALL {
            stored.mark_complete(source);
        }
        let checkpoint = Checkpoint::in_store(dir.path());
        checkpoint.save(&stored).unwrap();

        let source: Arc<dyn SourceStore> = Arc::new(LegacyDrive::open(dir.path(), &key).unwrap());
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let outcome = Extractor::new(source, checkpoint, &reporter)
            .extract(None)
            .await
            .unwrap();

        assert!(outcome.resumed);
        assert_eq!(outcome.snapshot, stored);
        assert!(sink.has_code("checkpoint_resumed"));
    }

    #[tokio::test]
    async fn seed_is_the_starting_accumulator() {
        let dir = TempDir::new().unwrap();
        let key = ContentKey::generate();
        legacy_store(dir.path(), &key);

        let mut seed = Snapshot::new();
        seed.local.insert("seeded".into(), json!(true));
        seed.mark_complete(LogSource::Main);

        let source: Arc<dyn SourceStore> = Arc::new(LegacyDrive::open(dir.path(), &key).unwrap());
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let outcome = Extractor::new(source, Checkpoint::in_store(dir.path()), &reporter)
            .extract(Some(seed))
            .await
            .unwrap();

        assert_eq!(outcome.snapshot.local["seeded"], json!(true));
        assert_eq!(outcome.snapshot.local["cursor"], json!(4));
        assert_eq!(outcome.snapshot.completed.len(), 3);
    }

    #[tokio::test]
    async fn malformed_record_aborts_extraction() {
        let dir = TempDir::new().unwrap();
        let key = ContentKey::generate();
        legacy_store(dir.path(), &key);
        let local = dir.path().join("Database").join("local");
        writeln!(
            std::fs::OpenOptions::new().append(true).open(&local).unwrap(),
            "{{\"seq\":9,\"data\":\"!!!\"}}"
        )
        .unwrap();

        let source: Arc<dyn SourceStore> = Arc::new(LegacyDrive::open(dir.path(), &key).unwrap());
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let result = Extractor::new(source, Checkpoint::in_store(dir.path()), &reporter)
            .extract(None)
            .await;

        assert_matches!(
            result,
            Err(MigrationError::Extraction {
                source_log: LogSource::Local,
                ..
            })
        );
    }
}
