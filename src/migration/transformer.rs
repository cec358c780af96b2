//! # Record Transformer (记录转换)
//!
//! 按策略表把快照中的集合记录转换为新存储的文档。
//!
//! ## 规则
//!
//! - main 日志是键值重放：同一集合内按键折叠，保留最后一次写入（位于该次写入的位置）；
//!   最后一次写入是删除事务的键不再存活
//! - 文件集合最先处理，它产出的跳过集（路径与稳定 id）对其他集合同样生效
//! - 默认策略：原样复制，去掉子集合标签
//! - 文件策略：删除、墓碑、旧版备份、不安全或重复的 id、缺失 blob 都进入跳过集，
//!   其余按稳定 id 安排 blob 搬迁
//! - 邮件策略：解密 blob 重建记录，时间统一为 UTC，正文只保留前 N 个词；
//!   邮件 blob 按显示路径搬迁
//! - meta 条目引用的 blob（旧版备份除外）按显示路径搬迁
//! - 有效性判定不通过的记录静默丢弃（计数）

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use super::events::{EventReporter, MigrationPhase};
use super::policy::{
    CollectionPolicy, PolicyTable, RecordPolicy, FILE_COLLECTION, LEGACY_BACKUP_PATH,
};
use super::snapshot::Snapshot;
use super::{MigrationError, Result};
use crate::feed::{LogRecord, SUB_LABEL};
use crate::store::{blob_relative_path, is_safe_file_name, LogSource, SourceStore};

/// 邮件正文预览的默认词数
pub const DEFAULT_PREVIEW_WORDS: usize = 20;

/// 转换后的记录
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    /// 原记录键
    pub key: String,
    /// 写入新存储的文档
    pub doc: Value,
    /// 全文索引用的文档（邮件为完整解密内容）；`None` 时使用 `doc`
    pub search_doc: Option<Value>,
}

impl TransformedRecord {
    pub fn search_source(&self) -> &Value {
        self.search_doc.as_ref().unwrap_or(&self.doc)
    }
}

/// 一个集合的转换结果（保持快照中的顺序）
#[derive(Debug, Clone)]
pub struct TransformedCollection {
    pub name: String,
    pub policy: CollectionPolicy,
    pub records: Vec<TransformedRecord>,
}

/// 待搬迁的 blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMove {
    /// `Files/` 下的目标相对路径：文件记录为稳定 id，meta 与邮件 blob 为显示路径
    pub target: PathBuf,
    /// 旧存储中的显示路径
    pub path: String,
    /// 旧存储中的磁盘位置
    pub source: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransformStats {
    pub emitted: usize,
    /// 按键折叠掉的旧写入
    pub superseded: usize,
    /// 最后一次写入为删除事务的键
    pub deleted: usize,
    /// 其中属于文件集合的
    pub deleted_files: usize,
    pub tombstoned: usize,
    pub backup_skipped: usize,
    pub unsafe_ids: usize,
    pub missing_blobs: usize,
    /// 与先前文件记录共用稳定 id
    pub duplicate_ids: usize,
    pub unreadable_blobs: usize,
    /// 按显示路径搬迁的 blob（meta 引用与邮件）
    pub relocated_blobs: usize,
    /// 目标位置已被其他来源占用
    pub blob_conflicts: usize,
    /// 有效性判定不通过
    pub invalid_dropped: usize,
    /// 路径命中跳过集
    pub excluded_by_skip_set: usize,
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    /// 文件集合在前，其余按名称排序
    pub collections: Vec<TransformedCollection>,
    pub blob_moves: Vec<BlobMove>,
    /// 未能存活的文件实体（路径与稳定 id）
    pub skipped: BTreeSet<String>,
    pub stats: TransformStats,
    /// 目标相对路径 → `blob_moves` 下标
    pub(crate) targets: HashMap<PathBuf, usize>,
}

impl TransformOutput {
    /// 已登记到该目标的搬迁
    fn scheduled(&self, target: &Path) -> Option<&BlobMove> {
        self.targets.get(target).map(|&i| &self.blob_moves[i])
    }

    /// 登记 blob 搬迁；同一来源重复登记返回 `Ok(false)`，目标被其他来源占用时返回该来源
    fn schedule(&mut self, blob: BlobMove) -> std::result::Result<bool, PathBuf> {
        if let Some(existing) = self.scheduled(&blob.target) {
            return if existing.source == blob.source {
                Ok(false)
            } else {
                Err(existing.source.clone())
            };
        }
        self.targets.insert(blob.target.clone(), self.blob_moves.len());
        self.blob_moves.push(blob);
        Ok(true)
    }
}

/// 记录转换器
pub struct Transformer<'a> {
    source: &'a dyn SourceStore,
    table: &'static PolicyTable,
    preview_words: usize,
    now: DateTime<Utc>,
    reporter: &'a EventReporter<'a>,
}

impl<'a> Transformer<'a> {
    pub(crate) fn new(
        source: &'a dyn SourceStore,
        table: &'static PolicyTable,
        reporter: &'a EventReporter<'a>,
    ) -> Self {
        Self {
            source,
            table,
            preview_words: DEFAULT_PREVIEW_WORDS,
            now: Utc::now(),
            reporter,
        }
    }

    pub(crate) fn with_preview_words(mut self, words: usize) -> Self {
        self.preview_words = words;
        self
    }

    /// 缺失 `updatedAt` 时使用的当前时间
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub(crate) fn transform(&self, snapshot: &Snapshot) -> Result<TransformOutput> {
        let missing: Vec<LogSource> = LogSource::ALL
            .into_iter()
            .filter(|s| !snapshot.is_complete_for(*s))
            .collect();
        if !missing.is_empty() {
            return Err(MigrationError::IncompleteSnapshot(missing));
        }

        let mut out = TransformOutput::default();

        let ordered = snapshot
            .main
            .collections
            .get_key_value(FILE_COLLECTION)
            .into_iter()
            .chain(
                snapshot
                    .main
                    .collections
                    .iter()
                    .filter(|(name, _)| name.as_str() != FILE_COLLECTION),
            );

        for (name, records) in ordered {
            let policy = self.table.policy_for(name);
            let collapsed = collapse_by_key(records);
            out.stats.superseded += collapsed.superseded;
            out.stats.deleted += collapsed.removed.len();
            if policy.record == RecordPolicy::File {
                for removed in &collapsed.removed {
                    out.stats.deleted_files += 1;
                    skip_file_entity(removed, &mut out.skipped);
                }
            }

            let mut emitted = Vec::with_capacity(collapsed.live.len());
            for record in collapsed.live {
                if let Some(transformed) = self.transform_record(name, &policy, record, &mut out) {
                    emitted.push(transformed);
                }
            }
            tracing::debug!(
                "[Transformer] {} : {} 条记录 -> {} 条",
                name,
                records.len(),
                emitted.len()
            );
            out.stats.emitted += emitted.len();
            out.collections.push(TransformedCollection {
                name: name.clone(),
                policy,
                records: emitted,
            });
        }

        self.relocate_meta_blobs(snapshot, &mut out);

        let stats = &out.stats;
        self.reporter.info(
            MigrationPhase::Transformation,
            "records_transformed",
            format!(
                "emitted {} records; {} deleted, {} tombstoned, {} missing blobs, {} invalid, {} excluded, {} scheduled blob copies",
                stats.emitted,
                stats.deleted,
                stats.tombstoned,
                stats.missing_blobs,
                stats.invalid_dropped,
                stats.excluded_by_skip_set,
                out.blob_moves.len()
            ),
        );
        Ok(out)
    }

    fn transform_record(
        &self,
        collection: &str,
        policy: &CollectionPolicy,
        record: &LogRecord,
        out: &mut TransformOutput,
    ) -> Option<TransformedRecord> {
        if policy.record != RecordPolicy::File {
            if let Some(path) = record.value.get("path").and_then(Value::as_str) {
                if out.skipped.contains(path) {
                    out.stats.excluded_by_skip_set += 1;
                    tracing::debug!(
                        "[Transformer] {}/{} 引用已跳过的文件 {}",
                        collection,
                        record.key,
                        path
                    );
                    return None;
                }
            }
        }

        let (doc, search_doc) = match policy.record {
            RecordPolicy::Default => (strip_label(&record.value), None),
            RecordPolicy::File => (self.transform_file(record, out)?, None),
            RecordPolicy::Email => {
                let (email, full) = self.rebuild_email(record, out)?;
                (email, Some(full))
            }
        };

        if !policy.is_valid(&doc) {
            out.stats.invalid_dropped += 1;
            return None;
        }

        if policy.record == RecordPolicy::Email {
            if let Some(path) = doc.get("path").and_then(Value::as_str) {
                let owner = format!("email record '{}'", record.key);
                self.relocate_by_path(&owner, path, out);
            }
        }

        Some(TransformedRecord {
            key: record.key.clone(),
            doc,
            search_doc,
        })
    }

    fn transform_file(&self, record: &LogRecord, out: &mut TransformOutput) -> Option<Value> {
        let value = &record.value;
        let path = value.get("path").and_then(Value::as_str);
        let id = value
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or(&record.key)
            .to_string();

        let skip = |out: &mut TransformOutput| skip_file_entity(record, &mut out.skipped);

        if value.get("deleted").and_then(Value::as_bool) == Some(true) {
            out.stats.tombstoned += 1;
            skip(out);
            return None;
        }

        if path == Some(LEGACY_BACKUP_PATH) || record.key == LEGACY_BACKUP_PATH.trim_start_matches('/')
        {
            out.stats.backup_skipped += 1;
            skip(out);
            return None;
        }

        if !is_safe_file_name(&id) {
            out.stats.unsafe_ids += 1;
            skip(out);
            self.reporter.warning(
                MigrationPhase::Transformation,
                "file_id_unusable",
                format!("file record '{}' has an unusable id '{}'", record.key, id),
            );
            return None;
        }

        let located = path.and_then(|p| self.source.blob_path(p).map(|source| (p, source)));
        let Some((path, source)) = located else {
            out.stats.missing_blobs += 1;
            skip(out);
            self.reporter.warning(
                MigrationPhase::Transformation,
                "blob_missing",
                format!(
                    "file record '{}' references a blob that is not on disk ({})",
                    record.key,
                    path.unwrap_or("<no path>")
                ),
            );
            return None;
        };

        let target = PathBuf::from(&id);
        if let Some(first_path) = out.scheduled(&target).map(|m| m.path.clone()) {
            // 先出现的记录保留；后者的路径若不同则整体跳过
            if first_path != path {
                out.skipped.insert(path.to_string());
            }
            out.stats.duplicate_ids += 1;
            self.reporter.warning(
                MigrationPhase::Transformation,
                "file_id_duplicate",
                format!(
                    "file record '{}' reuses id '{}' of an earlier file ({}); skipped",
                    record.key, id, first_path
                ),
            );
            return None;
        }

        let mut doc = strip_label(value);
        if let Value::Object(map) = &mut doc {
            map.entry("uuid")
                .or_insert_with(|| Value::String(id.clone()));
        }
        // 目标未被占用，登记必然成功
        let _ = out.schedule(BlobMove {
            target,
            path: path.to_string(),
            source,
        });
        Some(doc)
    }

    /// meta 条目引用的 blob 按显示路径搬入新存储；缺失的已在抽取阶段告警
    fn relocate_meta_blobs(&self, snapshot: &Snapshot, out: &mut TransformOutput) {
        for (key, value) in &snapshot.meta {
            let Some(path) = value.get("path").and_then(Value::as_str) else {
                continue;
            };
            if path == LEGACY_BACKUP_PATH {
                continue;
            }
            if out.skipped.contains(path) {
                out.stats.excluded_by_skip_set += 1;
                tracing::debug!("[Transformer] meta {} 引用已跳过的文件 {}", key, path);
                continue;
            }
            self.relocate_by_path(&format!("metadata entry '{}'", key), path, out);
        }
    }

    fn relocate_by_path(&self, owner: &str, path: &str, out: &mut TransformOutput) {
        let (Some(target), Some(source)) = (blob_relative_path(path), self.source.blob_path(path))
        else {
            tracing::debug!("[Transformer] {} 的 blob {} 不在磁盘上", owner, path);
            return;
        };
        match out.schedule(BlobMove {
            target,
            path: path.to_string(),
            source,
        }) {
            Ok(true) => out.stats.relocated_blobs += 1,
            Ok(false) => {}
            Err(existing) => {
                out.stats.blob_conflicts += 1;
                self.reporter.warning(
                    MigrationPhase::Transformation,
                    "blob_target_conflict",
                    format!(
                        "{} blob '{}' collides with {} in the new store; not copied",
                        owner,
                        path,
                        existing.display()
                    ),
                );
            }
        }
    }

    /// 读取并解密邮件 blob，返回 (重建的记录, 完整邮件)
    fn rebuild_email(&self, record: &LogRecord, out: &mut TransformOutput) -> Option<(Value, Value)> {
        let Some(path) = record.value.get("path").and_then(Value::as_str) else {
            out.stats.unreadable_blobs += 1;
            self.reporter.warning(
                MigrationPhase::Transformation,
                "email_blob_unreadable",
                format!("email record '{}' has no blob path", record.key),
            );
            return None;
        };

        let full = self
            .source
            .read_file(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(|e| e.to_string()))
            .and_then(|v| {
                if v.is_object() {
                    Ok(v)
                } else {
                    Err("email blob is not a JSON object".to_string())
                }
            });

        match full {
            Ok(full) => {
                let email = build_email(&record.value, &full, path, self.preview_words, self.now);
                Some((email, full))
            }
            Err(reason) => {
                out.stats.unreadable_blobs += 1;
                self.reporter.warning(
                    MigrationPhase::Transformation,
                    "email_blob_unreadable",
                    format!("email record '{}' ({}): {}", record.key, path, reason),
                );
                None
            }
        }
    }
}

struct Collapsed<'r> {
    /// 存活的键（最后一次写入）
    live: Vec<&'r LogRecord>,
    /// 被删除的键：删除前最后一次写入，从未写入过时为删除事务本身
    removed: Vec<&'r LogRecord>,
    superseded: usize,
}

/// 按键折叠：每个键只保留最后一次写入
fn collapse_by_key(records: &[LogRecord]) -> Collapsed<'_> {
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    let mut last_write: HashMap<&str, usize> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        last.insert(record.key.as_str(), i);
        if !record.is_delete() {
            last_write.insert(record.key.as_str(), i);
        }
    }

    let mut live = Vec::with_capacity(last.len());
    let mut removed = Vec::new();
    for (i, record) in records.iter().enumerate() {
        let key = record.key.as_str();
        if last.get(key) != Some(&i) {
            continue;
        }
        if record.is_delete() {
            removed.push(last_write.get(key).map_or(record, |&j| &records[j]));
        } else {
            live.push(record);
        }
    }
    Collapsed {
        live,
        removed,
        superseded: records.len() - last.len(),
    }
}

/// 文件实体的路径与稳定 id 进入跳过集
fn skip_file_entity(record: &LogRecord, skipped: &mut BTreeSet<String>) {
    if let Some(path) = record.value.get("path").and_then(Value::as_str) {
        skipped.insert(path.to_string());
    }
    let id = record
        .value
        .get("uuid")
        .and_then(Value::as_str)
        .unwrap_or(&record.key);
    skipped.insert(id.to_string());
}

fn strip_label(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(SUB_LABEL);
            Value::Object(map)
        }
        other => other.clone(),
    }
}

/// 由快照条目与解密后的完整邮件重建新版邮件记录
pub(crate) fn build_email(
    item: &Value,
    full: &Value,
    path: &str,
    preview_words: usize,
    now: DateTime<Utc>,
) -> Value {
    let mut email = Map::new();
    let copy = |email: &mut Map<String, Value>, from: &Value, field: &str| {
        if let Some(value) = from.get(field).filter(|v| !v.is_null()) {
            email.insert(field.to_string(), value.clone());
        }
    };

    copy(&mut email, full, "emailId");
    copy(&mut email, full, "aliasId");
    copy(&mut email, full, "folderId");
    email.insert("mailboxId".to_string(), Value::from(1));

    let date = full.get("date").and_then(normalize_timestamp);
    if let Some(date) = &date {
        email.insert("date".to_string(), Value::String(date.clone()));
    }
    copy(&mut email, item, "unread");
    copy(&mut email, full, "subject");
    copy(&mut email, full, "toJSON");
    copy(&mut email, full, "fromJSON");
    copy(&mut email, full, "attachments");
    email.insert("path".to_string(), Value::String(path.to_string()));

    if let Some(created) = full.get("createdAt").and_then(normalize_timestamp).or(date) {
        email.insert("createdAt".to_string(), Value::String(created));
    }
    let updated = full
        .get("updatedAt")
        .and_then(normalize_timestamp)
        .unwrap_or_else(|| format_utc(now));
    email.insert("updatedAt".to_string(), Value::String(updated));

    if let Some(body) = full.get("bodyAsText").and_then(Value::as_str) {
        email.insert(
            "bodyAsText".to_string(),
            Value::String(preview(body, preview_words)),
        );
    }

    Value::Object(email)
}

/// 前 `words` 个词
pub(crate) fn preview(text: &str, words: usize) -> String {
    text.split_whitespace()
        .take(words)
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 时间统一为 RFC 3339 UTC（毫秒精度，`Z` 结尾）
///
/// 接受 RFC 3339、RFC 2822、无时区的 ISO 时间（按 UTC 处理）、日期与毫秒时间戳。
pub(crate) fn normalize_timestamp(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(format_utc),
        Value::String(s) => parse_timestamp(s.trim()).map(format_utc),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
