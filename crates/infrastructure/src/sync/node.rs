use std::sync::Arc;

use async_trait::async_trait;
use ddl_domain::{NodeRegistry, SyncAction, SyncNode};
use ddl_errors::DdlResult;
use tokio::sync::RwLock;

use super::SchemaSyncHandler;

/// 本进程内的节点，直接调用同步处理器
pub struct LocalSyncNode {
    handler: SchemaSyncHandler,
}

impl LocalSyncNode {
    pub fn new(handler: SchemaSyncHandler) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl SyncNode for LocalSyncNode {
    fn node_id(&self) -> &str {
        self.handler.node_id()
    }

    async fn apply(&self, action: &SyncAction) -> DdlResult<()> {
        self.handler.handle(action).await
    }
}

/// 固定成员列表的节点注册表，节点可以在运行时加入和移除
#[derive(Default)]
pub struct StaticNodeRegistry {
    nodes: RwLock<Vec<Arc<dyn SyncNode>>>,
}

impl StaticNodeRegistry {
    pub fn new(nodes: Vec<Arc<dyn SyncNode>>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub async fn register(&self, node: Arc<dyn SyncNode>) {
        let mut nodes = self.nodes.write().await;
        nodes.retain(|existing| existing.node_id() != node.node_id());
        nodes.push(node);
    }

    pub async fn remove(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        let before = nodes.len();
        nodes.retain(|existing| existing.node_id() != node_id);
        nodes.len() != before
    }
}

#[async_trait]
impl NodeRegistry for StaticNodeRegistry {
    async fn live_nodes(&self) -> DdlResult<Vec<Arc<dyn SyncNode>>> {
        Ok(self.nodes.read().await.clone())
    }
}
