use std::sync::Arc;
use std::time::Duration;

use ddl_core::logging::DdlEventLogger;
use ddl_core::SyncConfig;
use ddl_domain::{NodeRegistry, SyncAction, SyncNode};
use ddl_errors::{DdlError, DdlResult};
use futures::future::join_all;
use tracing::{debug, info};

/// 一次广播的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub action: String,
    pub succeeded: Vec<String>,
    /// (节点ID, 最后一次错误)
    pub unreachable: Vec<(String, String)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }
}

/// 把同步命令并发发送给所有存活节点
///
/// 单个节点超时或失败只记录告警并体现在 `SyncReport` 中，不会让DDL任务失败。
pub struct SyncBroadcaster {
    registry: Arc<dyn NodeRegistry>,
    node_timeout: Duration,
    max_attempts: u32,
}

impl SyncBroadcaster {
    pub fn new(registry: Arc<dyn NodeRegistry>, config: &SyncConfig) -> Self {
        Self {
            registry,
            node_timeout: config.node_timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    pub async fn broadcast(&self, action: &SyncAction) -> DdlResult<SyncReport> {
        let nodes = self.registry.live_nodes().await?;
        debug!("广播同步命令 {} 到 {} 个节点", action, nodes.len());

        let results = join_all(
            nodes
                .iter()
                .map(|node| self.send_with_retry(node.as_ref(), action)),
        )
        .await;

        let mut report = SyncReport {
            action: action.to_string(),
            ..Default::default()
        };
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(()) => report.succeeded.push(node.node_id().to_string()),
                Err(e) => {
                    DdlEventLogger::log_sync_node_unreachable(
                        node.node_id(),
                        action.name(),
                        self.max_attempts,
                        &e.to_string(),
                    );
                    report
                        .unreachable
                        .push((node.node_id().to_string(), e.to_string()));
                }
            }
        }

        info!(
            action = %report.action,
            succeeded = report.succeeded.len(),
            unreachable = report.unreachable.len(),
            "同步命令广播完成"
        );
        Ok(report)
    }

    async fn send_with_retry(&self, node: &dyn SyncNode, action: &SyncAction) -> DdlResult<()> {
        let mut last_error = DdlError::Network(format!("节点 {} 未响应", node.node_id()));
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.node_timeout, node.apply(action)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = DdlError::Timeout(format!(
                        "节点 {} 在 {:?} 内未完成 {}",
                        node.node_id(),
                        self.node_timeout,
                        action.name()
                    ))
                }
            }
            debug!(
                node_id = %node.node_id(),
                attempt,
                "同步命令发送失败: {}",
                last_error
            );
        }
        Err(last_error)
    }
}
