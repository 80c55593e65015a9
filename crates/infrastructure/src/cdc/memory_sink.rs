use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ddl_domain::{CdcEvent, CdcSink};
use ddl_errors::DdlResult;

#[derive(Debug, Default)]
struct SinkState {
    delivered: HashSet<(i64, i64)>,
    events: Vec<CdcEvent>,
    attempts: u64,
}

/// 内存CDC下游，记录收到的事件
#[derive(Debug, Default)]
pub struct InMemoryCdcSink {
    state: Mutex<SinkState>,
}

impl InMemoryCdcSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CdcEvent> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    pub fn event_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    /// 包括被去重的调用
    pub fn delivery_attempts(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
    }
}

#[async_trait]
impl CdcSink for InMemoryCdcSink {
    async fn notify(&self, event: &CdcEvent) -> DdlResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.attempts += 1;
        if state.delivered.insert((event.job_id, event.task_id)) {
            state.events.push(event.clone());
        }
        Ok(())
    }
}
