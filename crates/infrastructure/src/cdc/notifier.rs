use std::sync::Arc;

use chrono::Utc;
use ddl_domain::{
    cdc_delivered_key, cdc_marker_key, CdcEvent, CdcSink, MetaStore, MetaTransaction,
};
use ddl_errors::DdlResult;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

/// CDC打标
///
/// 打标记录（即完整的事件）和元数据变更在同一个元数据事务中提交，提交之后才投递给下游。
/// 投递成功后提交 `cdc_delivered` 标记，恢复流程重新执行时先检查该标记，不再调用下游。
/// 只有在下游确认与标记提交之间崩溃时才会重复投递，此时由下游按 (job_id, task_id) 去重。
pub struct CdcNotifier {
    sink: Arc<dyn CdcSink>,
}

impl CdcNotifier {
    pub fn new(sink: Arc<dyn CdcSink>) -> Self {
        Self { sink }
    }

    /// 在事务中写入打标记录，已存在时返回false
    #[instrument(skip_all, fields(
        job_id = event.job_id,
        task_id = event.task_id,
        table = %event.table_name,
    ))]
    pub async fn mark(&self, txn: &mut dyn MetaTransaction, event: &CdcEvent) -> DdlResult<bool> {
        let marker_key = event.marker_key();
        if txn.get(&marker_key).await?.is_some() {
            info!("CDC打标记录已存在: {}", marker_key);
            return Ok(false);
        }
        txn.put(&marker_key, serde_json::to_value(event)?).await?;
        debug!(ddl_kind = %event.ddl_kind, "写入CDC打标记录");
        Ok(true)
    }

    /// 投递已提交的打标记录，没有已提交的记录或已经投递过时返回false
    pub async fn deliver(&self, store: &dyn MetaStore, job_id: i64, task_id: i64) -> DdlResult<bool> {
        let delivered_key = cdc_delivered_key(job_id, task_id);
        if store.get(&delivered_key).await?.is_some() {
            info!("CDC事件已投递，跳过: {}", delivered_key);
            return Ok(false);
        }
        let marker_key = cdc_marker_key(job_id, task_id);
        let Some(value) = store.get(&marker_key).await? else {
            debug!("没有已提交的CDC打标记录: {}", marker_key);
            return Ok(false);
        };
        let event: CdcEvent = serde_json::from_value(value)?;
        self.sink.notify(&event).await?;
        if let Err(e) = store
            .put_committed(&delivered_key, json!({ "delivered_at": Utc::now() }))
            .await
        {
            // 下次执行会重复投递，由下游去重
            warn!("写入CDC投递标记 {} 失败: {}", delivered_key, e);
        }
        info!(
            job_id,
            task_id,
            ddl_kind = %event.ddl_kind,
            visibility = event.visibility.as_str(),
            "CDC打标完成"
        );
        Ok(true)
    }
}
