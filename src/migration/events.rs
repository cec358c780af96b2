//! 迁移事件通道
//!
//! 管线通过注入的 [`MigrationEventSink`] 上报结构化事件（级别、阶段、代码、消息），
//! 同时镜像到 `tracing`。外部监控或恢复工具据此判断迁移状态。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// 事件级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// 迁移中止
    Fatal,
    /// 非致命问题，迁移继续
    Warning,
    Info,
}

/// 迁移阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Preflight,
    Extraction,
    Rekeying,
    Transformation,
    Loading,
    Finalization,
    Completed,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Preflight => "preflight",
            MigrationPhase::Extraction => "extraction",
            MigrationPhase::Rekeying => "rekeying",
            MigrationPhase::Transformation => "transformation",
            MigrationPhase::Loading => "loading",
            MigrationPhase::Finalization => "finalization",
            MigrationPhase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化迁移事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub level: EventLevel,
    pub phase: MigrationPhase,
    /// 机器可读代码，如 `blob_missing`、`insert_failed`
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl MigrationEvent {
    pub fn new(
        level: EventLevel,
        phase: MigrationPhase,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            phase,
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(phase: MigrationPhase, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, phase, code, message)
    }

    pub fn warning(
        phase: MigrationPhase,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EventLevel::Warning, phase, code, message)
    }

    pub fn fatal(phase: MigrationPhase, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Fatal, phase, code, message)
    }
}

/// 事件接收端
pub trait MigrationEventSink: Send + Sync {
    fn emit(&self, event: MigrationEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MigrationEventSink for NoopSink {
    fn emit(&self, _event: MigrationEvent) {}
}

/// 转发到 tokio 无界通道；接收端已关闭时静默丢弃
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<MigrationEvent>,
}

impl ChannelSink {
    pub fn new(sender: UnboundedSender<MigrationEvent>) -> Self {
        Self { sender }
    }
}

impl MigrationEventSink for ChannelSink {
    fn emit(&self, event: MigrationEvent) {
        let _ = self.sender.send(event);
    }
}

/// 在内存中收集事件（测试与报告用）
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<MigrationEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// 指定级别的事件
    pub fn with_level(&self, level: EventLevel) -> Vec<MigrationEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.events().iter().any(|e| e.code == code)
    }
}

impl MigrationEventSink for CollectingSink {
    fn emit(&self, event: MigrationEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// 把事件同时写入 `tracing` 与注入的 sink
pub(crate) struct EventReporter<'a> {
    sink: &'a dyn MigrationEventSink,
    warnings: AtomicUsize,
}

impl<'a> EventReporter<'a> {
    pub(crate) fn new(sink: &'a dyn MigrationEventSink) -> Self {
        Self {
            sink,
            warnings: AtomicUsize::new(0),
        }
    }

    /// 已上报的 warning 数
    pub(crate) fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    pub(crate) fn report(&self, event: MigrationEvent) {
        if event.level == EventLevel::Warning {
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
        match event.level {
            EventLevel::Fatal => tracing::error!(
                phase = event.phase.as_str(),
                code = %event.code,
                "❌ [Migration] {}",
                event.message
            ),
            EventLevel::Warning => tracing::warn!(
                phase = event.phase.as_str(),
                code = %event.code,
                "[Migration] {}",
                event.message
            ),
            EventLevel::Info => tracing::info!(
                phase = event.phase.as_str(),
                code = %event.code,
                "[Migration] {}",
                event.message
            ),
        }
        self.sink.emit(event);
    }

    pub(crate) fn info(&self, phase: MigrationPhase, code: &str, message: impl Into<String>) {
        self.report(MigrationEvent::info(phase, code, message));
    }

    pub(crate) fn warning(&self, phase: MigrationPhase, code: &str, message: impl Into<String>) {
        self.report(MigrationEvent::warning(phase, code, message));
    }

    pub(crate) fn fatal(&self, phase: MigrationPhase, code: &str, message: impl Into<String>) {
        self.report(MigrationEvent::fatal(phase, code, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_filters_by_level() {
        let sink = CollectingSink::new();
        let reporter = EventReporter::new(&sink);
        reporter.info(MigrationPhase::Extraction, "source_done", "main done");
        reporter.warning(MigrationPhase::Transformation, "blob_missing", "no blob");

        assert_eq!(sink.events().len(), 2);
        assert_eq!(reporter.warning_count(), 1);
        assert_eq!(sink.with_level(EventLevel::Warning).len(), 1);
        assert!(sink.has_code("blob_missing"));
        assert!(!sink.has_code("insert_failed"));
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.emit(MigrationEvent::fatal(
            MigrationPhase::Rekeying,
            "rekey",
            "boom",
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.level, EventLevel::Fatal);
        assert_eq!(event.phase, MigrationPhase::Rekeying);
    }

    #[test]
    fn event_serializes_with_snake_case_tags() {
        let event = MigrationEvent::warning(MigrationPhase::Loading, "index_failed", "x");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["phase"], "loading");
    }
}
