//! # Loader (写入新存储)
//!
//! - meta/local 键值对直写对应日志，不经过集合校验与索引；写入失败是致命的结构性错误
//! - 集合按转换结果的顺序打开并插入；每条插入后按策略写全文索引
//! - 集合插入完成后创建有序索引
//! - 插入与索引失败只计数告警，不中止迁移，也不回滚已完成的插入

use serde_json::Value;

use super::events::{EventReporter, MigrationPhase};
use super::snapshot::Snapshot;
use super::transformer::{TransformOutput, TransformedCollection};
use super::Result;
use crate::store::drive::DOC_ID_FIELD;
use crate::store::TargetStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub meta_written: usize,
    pub local_written: usize,
    pub collections: usize,
    pub inserted: usize,
    pub insert_failures: usize,
    pub index_failures: usize,
}

pub(crate) struct Loader<'a, T: TargetStore + ?Sized> {
    target: &'a mut T,
    reporter: &'a EventReporter<'a>,
    stats: LoadStats,
}

impl<'a, T: TargetStore + ?Sized> Loader<'a, T> {
    pub(crate) fn new(target: &'a mut T, reporter: &'a EventReporter<'a>) -> Self {
        Self {
            target,
            reporter,
            stats: LoadStats::default(),
        }
    }

    pub(crate) fn load(mut self, snapshot: &Snapshot, output: &TransformOutput) -> Result<LoadStats> {
        for (key, value) in &snapshot.meta {
            self.target.meta_put(key, value)?;
            self.stats.meta_written += 1;
        }
        for (key, value) in &snapshot.local {
            self.target.local_put(key, value)?;
            self.stats.local_written += 1;
        }
        tracing::info!(
            "[Loader] 已写入 meta {} 条, local {} 条",
            self.stats.meta_written,
            self.stats.local_written
        );

        for collection in &output.collections {
            self.load_collection(collection);
        }

        if self.stats.insert_failures > 0 || self.stats.index_failures > 0 {
            self.reporter.warning(
                MigrationPhase::Loading,
                "load_incomplete",
                format!(
                    "{} insert failures and {} index failures while loading",
                    self.stats.insert_failures, self.stats.index_failures
                ),
            );
        }
        self.reporter.info(
            MigrationPhase::Loading,
            "records_loaded",
            format!(
                "inserted {} records into {} collections",
                self.stats.inserted, self.stats.collections
            ),
        );
        Ok(self.stats)
    }

    fn load_collection(&mut self, collection: &TransformedCollection) {
        let name = collection.name.as_str();
        if let Err(e) = self.target.open_collection(name) {
            self.stats.insert_failures += collection.records.len();
            self.reporter.warning(
                MigrationPhase::Loading,
                "collection_open_failed",
                format!(
                    "cannot open collection '{}' ({} records not loaded): {}",
                    name,
                    collection.records.len(),
                    e
                ),
            );
            return;
        }
        self.stats.collections += 1;

        let policy = &collection.policy;
        for record in &collection.records {
            let id = match self.target.insert(name, &record.doc) {
                Ok(id) => id,
                Err(e) => {
                    self.stats.insert_failures += 1;
                    self.reporter.warning(
                        MigrationPhase::Loading,
                        "insert_failed",
                        format!("insert of '{}' into '{}' failed: {}", record.key, name, e),
                    );
                    continue;
                }
            };
            self.stats.inserted += 1;

            if policy.has_search_fields() {
                let mut search_doc = record.search_source().clone();
                if let Value::Object(map) = &mut search_doc {
                    map.insert(DOC_ID_FIELD.to_string(), Value::String(id.clone()));
                }
                if let Err(e) = self
                    .target
                    .fts_index(name, policy.search_fields, &id, &search_doc)
                {
                    self.stats.index_failures += 1;
                    self.reporter.warning(
                        MigrationPhase::Loading,
                        "search_index_failed",
                        format!("full-text index of '{}' in '{}' failed: {}", id, name, e),
                    );
                }
            }
        }

        for fields in policy.sort_indexes {
            if let Err(e) = self.target.create_index(name, fields) {
                self.stats.index_failures += 1;
                self.reporter.warning(
                    MigrationPhase::Loading,
                    "index_failed",
                    format!("index {:?} on '{}' failed: {}", fields, name, e),
                );
            }
        }
        tracing::debug!(
            "[Loader] 集合 {} 已写入 {} 条记录",
            name,
            collection.records.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::events::CollectingSink;
    use crate::migration::policy::{CollectionPolicy, RecordPolicy};
    use crate::migration::transformer::TransformedRecord;
    use crate::store::{StoreError, StoreResult};
    use assert_matches::assert_matches;
    use serde_json::json;

    /// 内存中的目标存储，可注入失败
    #[derive(Default)]
    struct MemoryTarget {
        opened: Vec<String>,
        docs: Vec<(String, Value)>,
        searched: Vec<(String, Value)>,
        indexes: Vec<(String, Vec<String>)>,
        meta: Vec<(String, Value)>,
        local: Vec<(String, Value)>,
        reject_insert_key: Option<&'static str>,
        fail_indexes: bool,
        fail_meta: bool,
    }

    impl TargetStore for MemoryTarget {
        fn open_collection(&mut self, name: &str) -> StoreResult<()> {
            self.opened.push(name.to_string());
            Ok(())
        }

        fn insert(&mut self, collection: &str, doc: &Value) -> StoreResult<String> {
            if let Some(bad) = self.reject_insert_key {
                if doc.get("name").and_then(Value::as_str) == Some(bad) {
                    return Err(StoreError::InvalidDocument(bad.to_string()));
                }
            }
            self.docs.push((collection.to_string(), doc.clone()));
            Ok(format!("id-{}", self.docs.len()))
        }

        fn fts_index(
            &mut self,
            collection: &str,
            _fields: &[&str],
            _doc_id: &str,
            doc: &Value,
        ) -> StoreResult<()> {
            self.searched.push((collection.to_string(), doc.clone()));
            Ok(())
        }

        fn create_index(&mut self, collection: &str, fields: &[&str]) -> StoreResult<()> {
            if self.fail_indexes {
                return Err(StoreError::InvalidName(fields.join(",")));
            }
            self.indexes.push((
                collection.to_string(),
                fields.iter().map(|f| f.to_string()).collect(),
            ));
            Ok(())
        }

        fn meta_put(&mut self, key: &str, value: &Value) -> StoreResult<()> {
            if self.fail_meta {
                return Err(StoreError::NotFound("meta log".into()));
            }
            self.meta.push((key.to_string(), value.clone()));
            Ok(())
        }

        fn local_put(&mut self, key: &str, value: &Value) -> StoreResult<()> {
            self.local.push((key.to_string(), value.clone()));
            Ok(())
        }
    }

    fn contact_output(names: &[&str]) -> TransformOutput {
        let policy = CollectionPolicy::new("Contact", RecordPolicy::Default)
            .with_search_fields(&["name"])
            .with_sort_indexes(&[&["name"]]);
        TransformOutput {
            collections: vec![TransformedCollection {
                name: "Contact".into(),
                policy,
                records: names
                    .iter()
                    .map(|n| TransformedRecord {
                        key: n.to_string(),
                        doc: json!({"name": n}),
                        search_doc: None,
                    })
                    .collect(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn loads_kv_pairs_and_collections_in_order() {
        let mut snapshot = Snapshot::new();
        snapshot.meta.insert("theme".into(), json!("dark"));
        snapshot.local.insert("cursor".into(), json!(1));
        let output = contact_output(&["ann", "bo"]);

        let mut target = MemoryTarget::default();
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let stats = Loader::new(&mut target, &reporter)
            .load(&snapshot, &output)
            .unwrap();

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.meta_written, 1);
        assert_eq!(stats.local_written, 1);
        assert_eq!(target.docs[0].1["name"], "ann");
        assert_eq!(target.docs[1].1["name"], "bo");
        // 全文索引文档带上新 id
        assert_eq!(target.searched[1].1["_id"], "id-2");
        assert_eq!(target.indexes, vec![("Contact".to_string(), vec!["name".to_string()])]);
    }

    #[test]
    fn insert_and_index_failures_are_counted_not_fatal() {
        let output = contact_output(&["ann", "broken", "cy"]);
        let mut target = MemoryTarget {
            reject_insert_key: Some("broken"),
            fail_indexes: true,
            ..Default::default()
        };
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let stats = Loader::new(&mut target, &reporter)
            .load(&Snapshot::new(), &output)
            .unwrap();

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.insert_failures, 1);
        assert_eq!(stats.index_failures, 1);
        assert!(sink.has_code("insert_failed"));
        assert!(sink.has_code("index_failed"));
        assert!(sink.has_code("load_incomplete"));
    }

    #[test]
    fn meta_put_failure_is_fatal() {
        let mut snapshot = Snapshot::new();
        snapshot.meta.insert("k".into(), json!(1));
        let mut target = MemoryTarget {
            fail_meta: true,
            ..Default::default()
        };
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        let result = Loader::new(&mut target, &reporter).load(&snapshot, &TransformOutput::default());
        assert_matches!(result, Err(crate::migration::MigrationError::Store(_)));
        assert!(target.opened.is_empty());
    }
}
