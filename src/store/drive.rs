//! # Drive (新版存储)
//!
//! 新版目录布局：
//!
//! ```text
//! <dir>/Database/{main,meta,local,...}   format 2 日志（签名块）
//! <dir>/Files/<稳定 id | 显示路径>        nonce ‖ AES-GCM 密文
//! <dir>/Index/collections.db             集合查询引擎（SQLite）
//! ```
//!
//! 集合文档追加写入 main 日志（带子集合标签），同时镜像到 [`CollectionIndex`]
//! 以支持查询、全文检索与有序索引。meta/local 为直写键值日志。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::collection::CollectionIndex;
use super::{
    blob_relative_path, is_plain_name, LogSource, StoreError, StoreResult, TargetStore,
    DATABASE_DIR, FILES_DIR,
};
use crate::crypto::{ContentKey, FeedKeyPair};
use crate::feed::{Feed, FeedFormat, SUB_LABEL};

/// 集合索引目录名
pub const INDEX_DIR: &str = "Index";
/// 集合索引数据库文件名
pub const INDEX_DB_FILE: &str = "collections.db";
/// 新版文档主键字段
pub const DOC_ID_FIELD: &str = "_id";

/// 新版存储
pub struct Drive {
    dir: PathBuf,
    key: ContentKey,
    main: Feed,
    meta: Feed,
    local: Feed,
    index: CollectionIndex,
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("dir", &self.dir)
            .field("main", &self.main)
            .finish()
    }
}

impl Drive {
    /// 初始化新版存储目录：创建目录结构与三路空的占位日志
    ///
    /// 占位日志使用新生成的签名密钥对，重建日志阶段会用旧日志的身份替换它们。
    pub fn init_layout(dir: &Path, key: &ContentKey) -> StoreResult<()> {
        for sub in [DATABASE_DIR, FILES_DIR, INDEX_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        for source in LogSource::ALL {
            let feed = Feed::create(
                &dir.join(DATABASE_DIR).join(source.file_name()),
                FeedFormat::Current,
                &FeedKeyPair::generate(),
                key,
            )?;
            feed.close()?;
        }
        tracing::debug!("[Drive] 已初始化新版存储目录: {}", dir.display());
        Ok(())
    }

    /// 打开新版存储；main 日志的签名身份必须与 `key_pair` 一致
    pub fn open(dir: &Path, key_pair: &FeedKeyPair, key: &ContentKey) -> StoreResult<Self> {
        let database = dir.join(DATABASE_DIR);
        let open_feed = |source: LogSource| -> StoreResult<Feed> {
            let feed = Feed::open(&database.join(source.file_name()), FeedFormat::Current, key)?;
            feed.ready()?;
            Ok(feed)
        };

        let main = open_feed(LogSource::Main)?;
        if main.signer() != key_pair {
            return Err(StoreError::Identity(format!(
                "main log at {} is signed by {}, expected {}",
                main.path().display(),
                main.signer().public_hex(),
                key_pair.public_hex()
            )));
        }
        let meta = open_feed(LogSource::Meta)?;
        let local = open_feed(LogSource::Local)?;

        let index_dir = dir.join(INDEX_DIR);
        fs::create_dir_all(&index_dir).map_err(|e| StoreError::io(&index_dir, e))?;
        let index = CollectionIndex::open(&index_dir.join(INDEX_DB_FILE))?;

        tracing::info!(
            "[Drive] 已打开新版存储: {}, main 公钥: {}",
            dir.display(),
            main.signer().public_hex()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            key: key.clone(),
            main,
            meta,
            local,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES_DIR)
    }

    /// 某路日志头中的签名密钥对
    pub fn signer(&self, source: LogSource) -> &FeedKeyPair {
        match source {
            LogSource::Main => self.main.signer(),
            LogSource::Meta => self.meta.signer(),
            LogSource::Local => self.local.signer(),
        }
    }

    /// 集合内全部文档（按写入顺序）
    pub fn find(&self, collection: &str) -> StoreResult<Vec<Value>> {
        self.index.find(collection)
    }

    /// 按字段等值查找第一条文档
    pub fn find_one(&self, collection: &str, field: &str, value: &Value) -> StoreResult<Option<Value>> {
        self.index.find_one(collection, field, value)
    }

    /// 全文检索
    pub fn search(&self, collection: &str, term: &str) -> StoreResult<Vec<Value>> {
        self.index.search(collection, term)
    }

    /// 集合上的有序索引名
    pub fn indexes(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.index.index_names(collection)
    }

    pub fn count(&self, collection: &str) -> StoreResult<usize> {
        self.index.count(collection)
    }

    pub fn meta_entries(&self) -> StoreResult<BTreeMap<String, Value>> {
        replay_entries(&self.meta)
    }

    pub fn local_entries(&self) -> StoreResult<BTreeMap<String, Value>> {
        replay_entries(&self.local)
    }

    /// blob 在磁盘上的位置：`Files/<稳定 id>` 或 `Files/<显示路径>`；不存在时返回 `None`
    pub fn blob_path(&self, name: &str) -> Option<PathBuf> {
        let location = self.files_dir().join(blob_relative_path(name)?);
        location.is_file().then_some(location)
    }

    /// 读取并解密 blob
    pub fn read_file(&self, name: &str) -> StoreResult<Vec<u8>> {
        let blob = self
            .blob_path(name)
            .ok_or_else(|| StoreError::NotFound(format!("blob '{}'", name)))?;
        let sealed = fs::read(&blob).map_err(|e| StoreError::io(&blob, e))?;
        self.key.open(&sealed).map_err(|source| StoreError::Decrypt {
            path: name.to_string(),
            source,
        })
    }

    /// 关闭存储：日志刷盘
    pub fn close(self) -> StoreResult<()> {
        self.main.close()?;
        self.meta.close()?;
        self.local.close()?;
        tracing::debug!("[Drive] 已关闭新版存储: {}", self.dir.display());
        Ok(())
    }
}

/// 重放键值日志：后写覆盖先写
fn replay_entries(feed: &Feed) -> StoreResult<BTreeMap<String, Value>> {
    let mut entries = BTreeMap::new();
    for record in feed.records()? {
        let record = record?;
        entries.insert(record.key, record.value);
    }
    Ok(entries)
}

impl TargetStore for Drive {
    fn open_collection(&mut self, name: &str) -> StoreResult<()> {
        if !is_plain_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        self.index.ensure_collection(name)
    }

    fn insert(&mut self, collection: &str, doc: &Value) -> StoreResult<String> {
        if !self.index.collection_exists(collection)? {
            return Err(StoreError::NotFound(format!("collection '{}'", collection)));
        }
        let Value::Object(fields) = doc else {
            return Err(StoreError::InvalidDocument(format!(
                "collection '{}' only accepts JSON objects",
                collection
            )));
        };

        let id = uuid::Uuid::new_v4().to_string();
        let mut body = fields.clone();
        body.insert(DOC_ID_FIELD.to_string(), Value::String(id.clone()));

        // 先写索引再追加日志：索引写失败时日志中不会留下孤儿文档
        let seq = self.main.len();
        let mut labelled = body.clone();
        labelled.insert(SUB_LABEL.to_string(), Value::String(collection.to_string()));
        self.index
            .put_document(collection, &id, seq, &Value::Object(body))?;

        if let Err(e) = self.main.append(&id, &Value::Object(labelled)) {
            if let Err(undo) = self.index.remove_document(collection, &id) {
                tracing::warn!("[Drive] 回滚索引文档 {} 失败: {}", id, undo);
            }
            return Err(e.into());
        }
        Ok(id)
    }

    fn fts_index(
        &mut self,
        collection: &str,
        fields: &[&str],
        doc_id: &str,
        doc: &Value,
    ) -> StoreResult<()> {
        self.index.index_text(collection, doc_id, fields, doc)
    }

    fn create_index(&mut self, collection: &str, fields: &[&str]) -> StoreResult<()> {
        let name = self.index.create_sorted_index(collection, fields)?;
        tracing::debug!("[Drive] 已创建索引 {}", name);
        Ok(())
    }

    fn meta_put(&mut self, key: &str, value: &Value) -> StoreResult<()> {
        self.meta.append(key, value)?;
        Ok(())
    }

    fn local_put(&mut self, key: &str, value: &Value) -> StoreResult<()> {
        self.local.append(key, value)?;
        Ok(())
    }
}
