//! # Collection Policy (集合策略表)
//!
//! 每个集合的转换方式、有效性判定与索引配方，按旧版 schema 版本静态定义。
//!
//! ## 设计原则
//!
//! - 转换逻辑只有一份（`transformer`），版本差异只体现在策略表
//! - 策略在运行期不可变：转换阶段每条记录查一次，加载阶段每个集合查一次
//! - 表中未列出的集合使用默认策略（原样复制，无索引）

use serde_json::Value;

pub use crate::store::FILE_COLLECTION;

/// 邮件集合名
pub const EMAIL_COLLECTION: &str = "Email";
/// 旧版自备份文件的路径，迁移时总是跳过
pub const LEGACY_BACKUP_PATH: &str = "/backup/encrypted.db";

/// 可迁移的旧版 schema 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// 日志 format 1
    Legacy1,
}

impl SchemaVersion {
    /// 由 main 日志头的格式版本识别；新版格式或未知版本返回 `None`
    pub fn from_format_version(version: u8) -> Option<Self> {
        match version {
            1 => Some(SchemaVersion::Legacy1),
            _ => None,
        }
    }
}

/// 记录转换方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPolicy {
    /// 原样复制，去掉子集合标签
    Default,
    /// 文件记录：墓碑与缺失 blob 进入跳过集，其余安排 blob 搬迁
    File,
    /// 邮件记录：从加密 blob 重建
    Email,
}

/// 单个集合的策略
#[derive(Clone, Copy)]
pub struct CollectionPolicy {
    pub name: &'static str,
    pub record: RecordPolicy,
    /// 有效性判定，不通过的记录被静默丢弃
    pub validity: fn(&Value) -> bool,
    /// 全文索引字段
    pub search_fields: &'static [&'static str],
    /// 有序二级索引（每项为一组字段）
    pub sort_indexes: &'static [&'static [&'static str]],
}

impl CollectionPolicy {
    pub const fn new(name: &'static str, record: RecordPolicy) -> Self {
        Self {
            name,
            record,
            validity: always_valid,
            search_fields: &[],
            sort_indexes: &[],
        }
    }

    pub const fn with_validity(mut self, validity: fn(&Value) -> bool) -> Self {
        self.validity = validity;
        self
    }

    pub const fn with_search_fields(mut self, fields: &'static [&'static str]) -> Self {
        self.search_fields = fields;
        self
    }

    pub const fn with_sort_indexes(mut self, indexes: &'static [&'static [&'static str]]) -> Self {
        self.sort_indexes = indexes;
        self
    }

    pub fn is_valid(&self, doc: &Value) -> bool {
        (self.validity)(doc)
    }

    pub fn has_search_fields(&self) -> bool {
        !self.search_fields.is_empty()
    }
}

impl std::fmt::Debug for CollectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionPolicy")
            .field("name", &self.name)
            .field("record", &self.record)
            .field("search_fields", &self.search_fields)
            .field("sort_indexes", &self.sort_indexes)
            .finish()
    }
}

fn always_valid(_doc: &Value) -> bool {
    true
}

/// 字段存在且为真值（非 null、非 false、非空字符串、非 0）
fn truthy(doc: &Value, field: &str) -> bool {
    match doc.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map_or(true, |f| f != 0.0),
        Some(_) => true,
    }
}

/// 邮件必须有 emailId，且至少关联一个文件夹或别名
fn email_is_valid(doc: &Value) -> bool {
    truthy(doc, "emailId") && (truthy(doc, "folderId") || truthy(doc, "aliasId"))
}

/// 版本化的策略表
#[derive(Debug)]
pub struct PolicyTable {
    pub version: SchemaVersion,
    policies: &'static [CollectionPolicy],
}

const LEGACY1_POLICIES: &[CollectionPolicy] = &[
    CollectionPolicy::new(FILE_COLLECTION, RecordPolicy::File),
    CollectionPolicy::new(EMAIL_COLLECTION, RecordPolicy::Email)
        .with_validity(email_is_valid)
        .with_search_fields(&[
            "subject",
            "toJSON",
            "fromJSON",
            "ccJSON",
            "bccJSON",
            "bodyAsText",
            "attachments",
        ])
        .with_sort_indexes(&[&["date", "folderId", "emailId"]]),
    CollectionPolicy::new("Contact", RecordPolicy::Default).with_search_fields(&["name", "email"]),
    CollectionPolicy::new("Folder", RecordPolicy::Default).with_sort_indexes(&[
        &["createdAt", "folderId", "mailboxId"],
        &["updatedAt"],
        &["seq"],
    ]),
    CollectionPolicy::new("Alias", RecordPolicy::Default)
        .with_sort_indexes(&[&["createdAt", "name"]]),
    CollectionPolicy::new("AliasNamespace", RecordPolicy::Default)
        .with_sort_indexes(&[&["name", "mailboxId"]]),
    CollectionPolicy::new("Files", RecordPolicy::Default)
        .with_sort_indexes(&[&["createdAt", "filename"], &["updatedAt"]]),
];

const DEFAULT_POLICY: CollectionPolicy = CollectionPolicy::new("", RecordPolicy::Default);

static LEGACY1_TABLE: PolicyTable = PolicyTable {
    version: SchemaVersion::Legacy1,
    policies: LEGACY1_POLICIES,
};

impl PolicyTable {
    pub fn for_version(version: SchemaVersion) -> &'static PolicyTable {
        match version {
            SchemaVersion::Legacy1 => &LEGACY1_TABLE,
        }
    }

    /// 集合的策略；未登记的集合使用默认策略
    pub fn policy_for(&self, collection: &str) -> CollectionPolicy {
        self.policies
            .iter()
            .find(|p| p.name == collection)
            .copied()
            .unwrap_or(DEFAULT_POLICY)
    }

    pub fn policies(&self) -> &'static [CollectionPolicy] {
        self.policies
    }
}
