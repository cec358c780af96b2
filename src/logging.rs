//! 日志初始化
//!
//! `RUST_LOG` 优先；未设置或无法解析时使用配置中的默认过滤器。

use tracing_subscriber::EnvFilter;

/// 由默认过滤器字符串构造 `EnvFilter`；`RUST_LOG` 存在时以其为准
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局 fmt 订阅者；已安装时返回 `false`
pub fn init_tracing(default_filter: &str) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_filter))
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("[Logging] tracing 已初始化, 默认过滤器: {}", default_filter);
    }
    installed
}
