//! # Legacy Drive (旧版存储)
//!
//! 旧版目录布局：
//!
//! ```text
//! <store>/Database/{main,meta,local,...}   format 1 日志
//! <store>/Files/<显示路径>                  nonce ‖ AES-GCM 密文
//! <store>/migrate/                          迁移检查点目录
//! ```
//!
//! [`LegacyDrive`] 只读，供迁移管线抽取快照与读取 blob；
//! [`LegacyDriveWriter`] 按旧版格式写入，用于构造迁移夹具与离线工具。

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{
    blob_relative_path, LogSource, RecordStream, SourceStore, StoreError, StoreResult,
    DATABASE_DIR, FILES_DIR, FILE_COLLECTION,
};
use crate::crypto::{ContentKey, FeedKeyPair};
use crate::feed::{Feed, FeedFormat, DELETE_OP, OP_LABEL, SUB_LABEL};

/// 迁移检查点目录名
pub const MIGRATE_DIR: &str = "migrate";

/// 旧版存储（只读）
pub struct LegacyDrive {
    dir: PathBuf,
    key: ContentKey,
}

impl LegacyDrive {
    /// 打开旧版存储：三路源日志必须存在且为 format 1
    pub fn open(dir: &Path, key: &ContentKey) -> StoreResult<Self> {
        let drive = Self {
            dir: dir.to_path_buf(),
            key: key.clone(),
        };
        for source in LogSource::ALL {
            let path = drive.feed_path(source);
            if !path.is_file() {
                return Err(StoreError::NotFound(format!(
                    "legacy log '{}' at {}",
                    source,
                    path.display()
                )));
            }
        }
        let main = Feed::open(&drive.feed_path(LogSource::Main), FeedFormat::Legacy, key)?;
        main.ready()?;
        tracing::info!(
            "[LegacyDrive] 已打开旧版存储: {}, main 公钥: {}",
            dir.display(),
            main.signer().public_hex()
        );
        main.close()?;
        Ok(drive)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn database_dir(&self) -> PathBuf {
        self.dir.join(DATABASE_DIR)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES_DIR)
    }

    fn feed_path(&self, source: LogSource) -> PathBuf {
        self.database_dir().join(source.file_name())
    }

    /// 读取某路日志头中的签名密钥对
    pub fn signer(&self, source: LogSource) -> StoreResult<FeedKeyPair> {
        let feed = Feed::open(&self.feed_path(source), FeedFormat::Legacy, &self.key)?;
        feed.ready()?;
        let signer = feed.signer().clone();
        feed.close()?;
        Ok(signer)
    }
}

impl SourceStore for LegacyDrive {
    fn open_stream(&self, source: LogSource) -> StoreResult<RecordStream> {
        let feed = Feed::open(&self.feed_path(source), FeedFormat::Legacy, &self.key)?;
        feed.ready()?;
        tracing::debug!(
            "[LegacyDrive] 打开读取流: {} ({} 条记录)",
            source,
            feed.len()
        );
        Ok(Box::new(feed.records()?))
    }

    fn read_file(&self, path: &str) -> StoreResult<Vec<u8>> {
        let blob = self
            .blob_path(path)
            .ok_or_else(|| StoreError::NotFound(format!("blob for '{}'", path)))?;
        let sealed = fs::read(&blob).map_err(|e| StoreError::io(&blob, e))?;
        self.key.open(&sealed).map_err(|source| StoreError::Decrypt {
            path: path.to_string(),
            source,
        })
    }

    fn blob_path(&self, path: &str) -> Option<PathBuf> {
        let location = self.files_dir().join(blob_relative_path(path)?);
        location.is_file().then_some(location)
    }
}

/// 旧版存储写入器
pub struct LegacyDriveWriter {
    dir: PathBuf,
    key: ContentKey,
    main: Feed,
    meta: Feed,
    local: Feed,
}

impl LegacyDriveWriter {
    /// 创建旧版存储；main 日志使用给定的签名密钥对，meta/local 各自生成
    pub fn create(dir: &Path, key_pair: &FeedKeyPair, key: &ContentKey) -> StoreResult<Self> {
        for sub in [DATABASE_DIR, FILES_DIR, MIGRATE_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        let database = dir.join(DATABASE_DIR);
        let main = Feed::create(
            &database.join(LogSource::Main.file_name()),
            FeedFormat::Legacy,
            key_pair,
            key,
        )?;
        let meta = Feed::create(
            &database.join(LogSource::Meta.file_name()),
            FeedFormat::Legacy,
            &FeedKeyPair::generate(),
            key,
        )?;
        let local = Feed::create(
            &database.join(LogSource::Local.file_name()),
            FeedFormat::Legacy,
            &FeedKeyPair::generate(),
            key,
        )?;
        Ok(Self {
            dir: dir.to_path_buf(),
            key: key.clone(),
            main,
            meta,
            local,
        })
    }

    /// 写入集合记录（值中附加子集合标签）
    pub fn put(&mut self, collection: &str, key: &str, value: Value) -> StoreResult<u64> {
        let mut labelled = match value {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        labelled.insert(SUB_LABEL.to_string(), Value::String(collection.to_string()));
        Ok(self.main.append(key, &Value::Object(labelled))?)
    }

    /// 删除集合中的键（追加一条删除事务）
    pub fn delete(&mut self, collection: &str, key: &str) -> StoreResult<u64> {
        let marker = serde_json::json!({
            SUB_LABEL: collection,
            OP_LABEL: DELETE_OP,
        });
        Ok(self.main.append(key, &marker)?)
    }

    /// 写入无标签的内部事务
    pub fn put_raw(&mut self, key: &str, value: Value) -> StoreResult<u64> {
        Ok(self.main.append(key, &value)?)
    }

    pub fn meta_put(&mut self, key: &str, value: Value) -> StoreResult<u64> {
        Ok(self.meta.append(key, &value)?)
    }

    pub fn local_put(&mut self, key: &str, value: Value) -> StoreResult<u64> {
        Ok(self.local.append(key, &value)?)
    }

    /// 加密写入 blob 到 `Files/<path>`
    pub fn write_file(&self, path: &str, content: &[u8]) -> StoreResult<PathBuf> {
        let relative = blob_relative_path(path)
            .ok_or_else(|| StoreError::NotFound(format!("invalid blob path '{}'", path)))?;
        let target = self.dir.join(FILES_DIR).join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let sealed = self.key.seal(content)?;
        fs::write(&target, sealed).map_err(|e| StoreError::io(&target, e))?;
        Ok(target)
    }

    /// 写入 blob 并登记文件记录（键为稳定 id）
    pub fn add_file(&mut self, id: &str, path: &str, content: &[u8]) -> StoreResult<u64> {
        self.write_file(path, content)?;
        let record = serde_json::json!({
            "uuid": id,
            "path": path,
            "size": content.len(),
            "createdAt": chrono::Utc::now().to_rfc3339(),
        });
        self.put(FILE_COLLECTION, id, record)
    }

    /// 额外的日志文件（如扩展集合各自的 core）
    pub fn create_extra_feed(&self, name: &str, key_pair: &FeedKeyPair) -> StoreResult<()> {
        let feed = Feed::create(
            &self.dir.join(DATABASE_DIR).join(name),
            FeedFormat::Legacy,
            key_pair,
            &self.key,
        )?;
        feed.close()?;
        Ok(())
    }

    pub fn close(self) -> StoreResult<()> {
        self.main.close()?;
        self.meta.close()?;
        self.local.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn written_store_reads_back_through_source_view() {
        let dir = TempDir::new().unwrap();
        let key = ContentKey::generate();
        let pair = FeedKeyPair::generate();

        let mut writer = LegacyDriveWriter::create(dir.path(), &pair, &key).unwrap();
        writer.put("foo", "alice", json!({"name": "alice"})).unwrap();
        writer.put_raw("__tx/1", json!({"type": "put"})).unwrap();
        writer.meta_put("uuid", json!("u-1")).unwrap();
        writer.add_file("f-1", "/index.js", b"console.log(1)").unwrap();
        writer.close().unwrap();

        let drive = LegacyDrive::open(dir.path(), &key).unwrap();
        assert_eq!(drive.signer(LogSource::Main).unwrap(), pair);

        let main: Vec<_> = drive
            .open_stream(LogSource::Main)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(main.len(), 3);
        assert_eq!(main[0].subcollection(), Some("foo"));
        assert_eq!(main[1].subcollection(), None);
        assert_eq!(main[2].subcollection(), Some(FILE_COLLECTION));
        assert_eq!(main[2].value["path"], "/index.js");

        assert_eq!(drive.read_file("/index.js").unwrap(), b"console.log(1)");
        assert!(drive.blob_path("/missing.bin").is_none());
    }

    #[test]
    fn open_requires_all_three_logs() {
        let dir = TempDir::new().unwrap();
        let key = ContentKey::generate();
        LegacyDriveWriter::create(dir.path(), &FeedKeyPair::generate(), &key)
            .unwrap()
            .close()
            .unwrap();
        fs::remove_file(dir.path().join(DATABASE_DIR).join("local")).unwrap();

        let result = LegacyDrive::open(dir.path(), &key);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
