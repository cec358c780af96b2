//! # drive-migrate
//!
//! 加密追加日志存储的跨版本迁移：把旧版（format 1）存储整体迁移为新版（format 2）存储，
//! 每个日志保持原有的签名身份，旧存储完整保留为 `<store>_old`。
//!
//! - `migration`：迁移管线（抽取 → 重建日志 → 转换 → 加载 → 收尾）
//! - `store`：旧版/新版存储的协作接口与本地参考实现
//! - `feed`：追加日志文件格式
//! - `crypto`：内容加密与日志签名
//! - `config` / `logging`：配置加载与日志初始化

pub mod config;
pub mod crypto;
pub mod feed;
pub mod fs_common;
pub mod logging;
pub mod migration;
pub mod store;

pub use crate::config::{ConfigError, MigrationConfig};
pub use crate::migration::{
    MigrationError, MigrationOptions, MigrationPipeline, MigrationReport, MigrationRequest,
};
