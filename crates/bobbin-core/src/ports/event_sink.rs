//! EventSink port - イベント記録の抽象化
//!
//! 遷移イベントを受け取る側。MetricsAggregator がこれを実装する。
//! `emit` は同期で、ストアのロック外から呼ばれる。

use std::sync::Arc;

use crate::domain::TaskEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TaskEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: &TaskEvent) {
        (**self).emit(event)
    }
}

/// 何もしない
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &TaskEvent) {}
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &TaskEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
