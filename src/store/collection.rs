//! # Collection Index (集合查询引擎)
//!
//! 新版存储的集合视图：文档本体追加在 main 日志中，查询与索引镜像到 SQLite。
//!
//! - `documents`：集合文档（body 为 JSON 文本）
//! - `search_index`：FTS5 全文索引
//! - 有序二级索引：`json_extract(body, '$.field')` 表达式索引

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{is_plain_name, StoreError, StoreResult};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS sorted_indexes (
    name TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    fields TEXT NOT NULL
);
CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
    collection UNINDEXED,
    doc_id UNINDEXED,
    content
);
"#;

/// SQLite 集合索引
pub struct CollectionIndex {
    conn: Connection,
}

impl CollectionIndex {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn ensure_collection(&self, name: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn put_document(&self, collection: &str, id: &str, seq: u64, body: &Value) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO documents (collection, id, seq, body) VALUES (?1, ?2, ?3, ?4)",
            params![collection, id, seq as i64, serde_json::to_string(body)?],
        )?;
        Ok(())
    }

    pub fn remove_document(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(())
    }

    /// 将文档指定字段的文本拼接后写入全文索引
    pub fn index_text(&self, collection: &str, doc_id: &str, fields: &[&str], doc: &Value) -> StoreResult<()> {
        let content = searchable_text(fields, doc);
        if content.is_empty() {
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO search_index (collection, doc_id, content) VALUES (?1, ?2, ?3)",
            params![collection, doc_id, content],
        )?;
        Ok(())
    }

    /// 创建有序二级索引，返回索引名；已存在时不重复创建
    pub fn create_sorted_index(&self, collection: &str, fields: &[&str]) -> StoreResult<String> {
        if !is_plain_name(collection) {
            return Err(StoreError::InvalidName(collection.to_string()));
        }
        if fields.is_empty() {
            return Err(StoreError::InvalidName(String::new()));
        }
        if let Some(bad) = fields.iter().find(|f| !is_plain_name(f)) {
            return Err(StoreError::InvalidName(bad.to_string()));
        }

        let name = format!("idx_{}_{}", collection, fields.join("_"));
        let columns = fields
            .iter()
            .map(|f| format!("json_extract(body, '$.{}')", f))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS \"{}\" ON documents (collection, {})",
            name, columns
        );
        self.conn.execute_batch(&sql)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO sorted_indexes (name, collection, fields) VALUES (?1, ?2, ?3)",
            params![name, collection, fields.join(",")],
        )?;
        Ok(name)
    }

    pub fn index_names(&self, collection: &str) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sorted_indexes WHERE collection = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn find(&self, collection: &str) -> StoreResult<Vec<Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM documents WHERE collection = ?1 ORDER BY seq")?;
        let bodies = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    pub fn find_one(&self, collection: &str, field: &str, value: &Value) -> StoreResult<Option<Value>> {
        if !is_plain_name(field) {
            return Err(StoreError::InvalidName(field.to_string()));
        }
        let sql = format!(
            "SELECT body FROM documents WHERE collection = ?1 AND json_extract(body, '$.{}') = json_extract(?2, '$') ORDER BY seq LIMIT 1",
            field
        );
        let body: Option<String> = self
            .conn
            .query_row(&sql, params![collection, serde_json::to_string(value)?], |row| {
                row.get(0)
            })
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    /// 全文检索（短语匹配）
    pub fn search(&self, collection: &str, term: &str) -> StoreResult<Vec<Value>> {
        let phrase = format!("\"{}\"", term.replace('"', "\"\""));
        let mut stmt = self.conn.prepare(
            "SELECT d.body FROM search_index s \
             JOIN documents d ON d.collection = s.collection AND d.id = s.doc_id \
             WHERE search_index MATCH ?1 AND s.collection = ?2 ORDER BY d.seq",
        )?;
        let bodies = stmt
            .query_map(params![phrase, collection], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    pub fn count(&self, collection: &str) -> StoreResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

/// 字段值拼接为全文检索文本；非字符串值按 JSON 文本收录
fn searchable_text(fields: &[&str], doc: &Value) -> String {
    fields
        .iter()
        .filter_map(|f| doc.get(*f))
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_index() -> (CollectionIndex, TempDir) {
        let dir = TempDir::new().unwrap();
        let index = CollectionIndex::open(&dir.path().join("collections.db")).unwrap();
        (index, dir)
    }

    #[test]
    fn find_one_matches_json_field() {
        let (index, _dir) = open_index();
        index.ensure_collection("Account").unwrap();
        index
            .put_document("Account", "1", 0, &json!({"name": "alice", "age": 3}))
            .unwrap();
        index
            .put_document("Account", "2", 1, &json!({"name": "bob"}))
            .unwrap();

        let bob = index.find_one("Account", "name", &json!("bob")).unwrap().unwrap();
        assert_eq!(bob["name"], "bob");
        let by_age = index.find_one("Account", "age", &json!(3)).unwrap().unwrap();
        assert_eq!(by_age["name"], "alice");
        assert!(index.find_one("Account", "name", &json!("carol")).unwrap().is_none());
        assert!(index.collection_exists("Account").unwrap());
        assert!(!index.collection_exists("Other").unwrap());
    }

    #[test]
    fn full_text_search_is_scoped_to_collection() {
        let (index, _dir) = open_index();
        let doc = json!({"subject": "quarterly report", "bodyAsText": "numbers attached"});
        index.put_document("Email", "e1", 0, &doc).unwrap();
        index
            .index_text("Email", "e1", &["subject", "bodyAsText"], &doc)
            .unwrap();

        assert_eq!(index.search("Email", "quarterly").unwrap().len(), 1);
        assert_eq!(index.search("Email", "attached").unwrap().len(), 1);
        assert!(index.search("Contact", "quarterly").unwrap().is_empty());
    }

    #[test]
    fn sorted_index_names_are_validated() {
        let (index, _dir) = open_index();
        let name = index
            .create_sorted_index("Folder", &["createdAt", "folderId"])
            .unwrap();
        assert_eq!(name, "idx_Folder_createdAt_folderId");
        // 重复创建是幂等的
        index.create_sorted_index("Folder", &["createdAt", "folderId"]).unwrap();
        assert_eq!(index.index_names("Folder").unwrap(), vec![name]);

        assert!(matches!(
            index.create_sorted_index("Folder", &["a'); DROP TABLE documents; --"]),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn searchable_text_flattens_values() {
        let doc = json!({"name": "Ann", "email": null, "tags": ["x", "y"]});
        assert_eq!(
            searchable_text(&["name", "email", "tags", "missing"], &doc),
            "Ann\n[\"x\",\"y\"]"
        );
    }
}
