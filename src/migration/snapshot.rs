//! # Snapshot (迁移快照与检查点)
//!
//! 抽取阶段把三路日志归并为 [`Snapshot`]，每路结束后持久化到
//! `<store>/migrate/data.json`。
//!
//! ## 检查点格式
//!
//! 读取端同时接受两种组织方式：
//!
//! 1. 单个 JSON 文档：
//!    ```text
//!    {"main":{"collections":{"Contact":[...]},"tx":[...]},"meta":{...},"local":[{"key":..,"value":..}],"completed":["main"]}
//!    ```
//!    `meta`/`local` 可以是映射，也可以是 `{key, value}` 序列；
//!    集合条目可以是完整记录 `{seq, key, value}`，也可以是裸值。
//! 2. 逐行 JSON（NDJSON），每行用 `source` 标注来源：
//!    ```text
//!    {"source":"main","collection":"Contact","record":{...}}
//!    {"source":"meta","key":"theme","value":"dark"}
//!    {"source":"done","of":"main"}
//!    ```
//!
//! 写入端始终写单个 JSON 文档（原子替换）。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{MigrationError, Result};
use crate::feed::LogRecord;
use crate::fs_common::atomic_write;
use crate::store::LogSource;

/// 检查点文件名
pub const CHECKPOINT_FILE: &str = "data.json";

/// main 日志快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MainSnapshot {
    /// 子集合 → 记录（保持写入顺序）
    #[serde(default, deserialize_with = "deserialize_collections")]
    pub collections: BTreeMap<String, Vec<LogRecord>>,
    /// 无标签的内部事务
    #[serde(default, deserialize_with = "deserialize_records")]
    pub tx: Vec<LogRecord>,
}

/// 旧存储三路日志的完整快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub main: MainSnapshot,
    #[serde(default, deserialize_with = "deserialize_entries")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "deserialize_entries")]
    pub local: BTreeMap<String, Value>,
    /// 已读到结尾的日志
    #[serde(default)]
    pub completed: Vec<LogSource>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把一条记录归入对应的桶
    pub fn route(&mut self, source: LogSource, record: LogRecord) {
        match source {
            LogSource::Main => match record.subcollection() {
                Some(collection) => {
                    let collection = collection.to_string();
                    self.main
                        .collections
                        .entry(collection)
                        .or_default()
                        .push(record);
                }
                None => self.main.tx.push(record),
            },
            LogSource::Meta => {
                self.meta.insert(record.key, record.value);
            }
            LogSource::Local => {
                self.local.insert(record.key, record.value);
            }
        }
    }

    pub fn mark_complete(&mut self, source: LogSource) {
        if !self.completed.contains(&source) {
            self.completed.push(source);
        }
    }

    pub fn is_complete_for(&self, source: LogSource) -> bool {
        self.completed.contains(&source)
    }

    /// 三路日志是否都已读到结尾
    pub fn is_complete(&self) -> bool {
        LogSource::ALL.iter().all(|s| self.is_complete_for(*s))
    }

    /// main 中带标签的记录总数
    pub fn collection_record_count(&self) -> usize {
        self.main.collections.values().map(Vec::len).sum()
    }
}

// ============================================================================
// 宽松反序列化
// ============================================================================

/// 完整记录或裸值
#[derive(Deserialize)]
#[serde(untagged)]
enum RecordEntry {
    Full(LogRecord),
    Bare(Value),
}

impl RecordEntry {
    /// 裸值按位置补齐序号，键取 `key`/`uuid`/`_id` 字段，都没有时用位置
    fn into_record(self, position: usize) -> LogRecord {
        match self {
            RecordEntry::Full(record) => record,
            RecordEntry::Bare(value) => {
                let key = ["key", "uuid", "_id"]
                    .iter()
                    .find_map(|f| value.get(*f).and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", position));
                LogRecord {
                    seq: position as u64,
                    key,
                    value,
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntriesRepr {
    Map(BTreeMap<String, Value>),
    List(Vec<KeyValue>),
}

fn deserialize_records<'de, D>(deserializer: D) -> std::result::Result<Vec<LogRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<RecordEntry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.into_record(i))
        .collect())
}

fn deserialize_collections<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<LogRecord>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Vec<RecordEntry>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, entries)| {
            let records = entries
                .into_iter()
                .enumerate()
                .map(|(i, e)| e.into_record(i))
                .collect();
            (name, records)
        })
        .collect())
}

fn deserialize_entries<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match EntriesRepr::deserialize(deserializer)? {
        EntriesRepr::Map(map) => map,
        EntriesRepr::List(list) => list.into_iter().map(|kv| (kv.key, kv.value)).collect(),
    })
}

/// NDJSON 检查点的一行
#[derive(Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
enum CheckpointLine {
    Main {
        #[serde(default)]
        collection: Option<String>,
        record: RecordEntry,
    },
    Meta {
        key: String,
        #[serde(default)]
        value: Value,
    },
    Local {
        key: String,
        #[serde(default)]
        value: Value,
    },
    Done {
        of: LogSource,
    },
}

// ============================================================================
// 检查点文件
// ============================================================================

/// 检查点文件
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<store>/migrate/data.json`
    pub fn in_store(store_dir: &Path) -> Self {
        Self::new(super::StoreLayout::checkpoint_in(store_dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn error(&self, reason: impl Into<String>) -> MigrationError {
        MigrationError::Checkpoint {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// 原子写入快照
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| MigrationError::io(parent, e))?;
        }
        let bytes = serde_json::to_vec(snapshot).map_err(|e| self.error(e.to_string()))?;
        atomic_write(&self.path, &bytes).map_err(|e| MigrationError::io(&self.path, e))?;
        tracing::debug!(
            "[Checkpoint] 已写入检查点: {} ({} bytes, completed={:?})",
            self.path.display(),
            bytes.len(),
            snapshot.completed
        );
        Ok(())
    }

    /// 读取检查点（单文档或 NDJSON）
    pub fn load(&self) -> Result<Snapshot> {
        let text = fs::read_to_string(&self.path).map_err(|e| MigrationError::io(&self.path, e))?;
        let Some(first) = text.lines().find(|l| !l.trim().is_empty()) else {
            return Err(self.error("empty checkpoint"));
        };

        let line_delimited = serde_json::from_str::<Value>(first)
            .ok()
            .and_then(|v| v.get("source").map(Value::is_string))
            .unwrap_or(false);

        if line_delimited {
            self.parse_lines(&text)
        } else {
            serde_json::from_str(&text).map_err(|e| self.error(e.to_string()))
        }
    }

    fn parse_lines(&self, text: &str) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: CheckpointLine = serde_json::from_str(line)
                .map_err(|e| self.error(format!("line {}: {}", index + 1, e)))?;
            match parsed {
                CheckpointLine::Main { collection, record } => match collection {
                    Some(name) => {
                        let bucket = snapshot.main.collections.entry(name).or_default();
                        let record = record.into_record(bucket.len());
                        bucket.push(record);
                    }
                    None => {
                        let record = record.into_record(snapshot.main.tx.len());
                        snapshot.route(LogSource::Main, record);
                    }
                },
                CheckpointLine::Meta { key, value } => {
                    snapshot.meta.insert(key, value);
                }
                CheckpointLine::Local { key, value } => {
                    snapshot.local.insert(key, value);
                }
                CheckpointLine::Done { of } => snapshot.mark_complete(of),
            }
        }
        Ok(snapshot)
    }

    pub fn remove(&self) -> std::io::Result<()> {
        fs::remove_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(seq: u64, key: &str, value: Value) -> LogRecord {
        LogRecord {
            seq,
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn route_buckets_every_record_once() {
        let mut snapshot = Snapshot::new();
        snapshot.route(
            LogSource::Main,
            record(0, "a", json!({"__sub": "Contact", "name": "a"})),
        );
        snapshot.route(LogSource::Main, record(1, "tx", json!({"op": "put"})));
        snapshot.route(LogSource::Meta, record(0, "theme", json!("light")));
        snapshot.route(LogSource::Meta, record(1, "theme", json!("dark")));
        snapshot.route(LogSource::Local, record(0, "cursor", json!(1)));

        assert_eq!(snapshot.main.collections["Contact"].len(), 1);
        assert_eq!(snapshot.main.tx.len(), 1);
        assert_eq!(snapshot.meta["theme"], json!("dark"));
        assert_eq!(snapshot.local.len(), 1);
        assert!(!snapshot.is_complete());
    }

    #[test]
    fn saved_checkpoint_loads_back() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::in_store(dir.path());
        let mut snapshot = Snapshot::new();
        snapshot.route(
            LogSource::Main,
            record(3, "k", json!({"__sub": "file", "uuid": "u1"})),
        );
        for source in LogSource::ALL {
            snapshot.mark_complete(source);
        }
        checkpoint.save(&snapshot).unwrap();

        let loaded = checkpoint.load().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(loaded.is_complete());
    }

    #[test]
    fn document_form_accepts_lists_and_bare_values() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("data.json"));
        fs::write(
            checkpoint.path(),
            json!({
                "main": {"collections": {"Contact": [{"name": "bare", "uuid": "c1"}]}},
                "meta": [{"key": "theme", "value": "dark"}],
                "local": {"cursor": 2}
            })
            .to_string(),
        )
        .unwrap();

        let snapshot = checkpoint.load().unwrap();
        let contact = &snapshot.main.collections["Contact"][0];
        assert_eq!(contact.key, "c1");
        assert_eq!(contact.value["name"], "bare");
        assert_eq!(snapshot.meta["theme"], json!("dark"));
        assert_eq!(snapshot.local["cursor"], json!(2));
        assert!(snapshot.completed.is_empty());
    }

    #[test]
    fn line_delimited_form_is_accepted() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("data.json"));
        let lines = [
            json!({"source": "main", "collection": "Alias", "record": {"seq": 0, "key": "a1", "value": {"name": "x"}}}),
            json!({"source": "main", "record": {"seq": 1, "key": "t", "value": {"op": "put"}}}),
            json!({"source": "done", "of": "main"}),
            json!({"source": "meta", "key": "uuid", "value": "m-1"}),
            json!({"source": "done", "of": "meta"}),
            json!({"source": "done", "of": "local"}),
        ];
        let text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        fs::write(checkpoint.path(), text).unwrap();

        let snapshot = checkpoint.load().unwrap();
        assert_eq!(snapshot.main.collections["Alias"][0].key, "a1");
        assert_eq!(snapshot.main.tx.len(), 1);
        assert_eq!(snapshot.meta["uuid"], json!("m-1"));
        assert!(snapshot.is_complete());
    }

    #[test]
    fn garbage_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("data.json"));
        fs::write(checkpoint.path(), "{not json").unwrap();
        assert_matches!(checkpoint.load(), Err(MigrationError::Checkpoint { .. }));

        fs::write(checkpoint.path(), "\n\n").unwrap();
        assert_matches!(checkpoint.load(), Err(MigrationError::Checkpoint { .. }));
    }
}
