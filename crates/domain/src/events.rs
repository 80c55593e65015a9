//! 跨节点同步命令与CDC事件
//!
//! 二者都会被序列化：同步命令广播到其他计算节点，CDC事件写入复制下游。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 广播到所有存活节点的同步命令，无状态且可以重复执行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncAction {
    InvalidateTable {
        schema_name: String,
        table_name: String,
    },
    ReloadTable {
        schema_name: String,
        table_name: String,
    },
    /// 让表切换到新的元数据版本，旧版本上的查询自然结束
    DropTable {
        schema_name: String,
        table_name: String,
    },
    Repartition {
        schema_name: String,
        primary_table: String,
        gsi_table: Option<String>,
        trace_id: String,
    },
}

impl SyncAction {
    pub fn name(&self) -> &'static str {
        match self {
            SyncAction::InvalidateTable { .. } => "InvalidateTable",
            SyncAction::ReloadTable { .. } => "ReloadTable",
            SyncAction::DropTable { .. } => "DropTable",
            SyncAction::Repartition { .. } => "Repartition",
        }
    }

    pub fn schema_name(&self) -> &str {
        match self {
            SyncAction::InvalidateTable { schema_name, .. }
            | SyncAction::ReloadTable { schema_name, .. }
            | SyncAction::DropTable { schema_name, .. }
            | SyncAction::Repartition { schema_name, .. } => schema_name,
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::InvalidateTable {
                schema_name,
                table_name,
            }
            | SyncAction::ReloadTable {
                schema_name,
                table_name,
            }
            | SyncAction::DropTable {
                schema_name,
                table_name,
            } => write!(f, "{}({}.{})", self.name(), schema_name, table_name),
            SyncAction::Repartition {
                schema_name,
                primary_table,
                ..
            } => write!(f, "{}({}.{})", self.name(), schema_name, primary_table),
        }
    }
}

/// DDL对下游复制的可见性，分区级别的变更对下游不可见
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DdlVisibility {
    #[default]
    Public,
    Private,
}

impl DdlVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlVisibility::Public => "PUBLIC",
            DdlVisibility::Private => "PRIVATE",
        }
    }
}

pub const TABLE_NEW_NAME: &str = "TABLE_NEW_NAME";
pub const TABLE_NEW_PATTERN: &str = "TABLE_NEW_PATTERN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcEvent {
    pub schema_name: String,
    pub table_name: String,
    /// 语句种类，例如 CREATE_TABLE、RENAME_TABLE
    pub ddl_kind: String,
    pub ddl_stmt: String,
    pub ddl_type: String,
    pub job_id: i64,
    pub task_id: i64,
    pub visibility: DdlVisibility,
    pub extra_params: BTreeMap<String, serde_json::Value>,
    pub trace_id: String,
    pub mark_time: DateTime<Utc>,
}

impl CdcEvent {
    pub fn marker_key(&self) -> String {
        cdc_marker_key(self.job_id, self.task_id)
    }
}

/// CDC打标记录的元数据键
pub fn cdc_marker_key(job_id: i64, task_id: i64) -> String {
    format!("cdc_mark:{job_id}:{task_id}")
}

/// CDC事件已投递给下游的元数据键，投递成功后单独提交
pub fn cdc_delivered_key(job_id: i64, task_id: i64) -> String {
    format!("cdc_delivered:{job_id}:{task_id}")
}

/// 子任务物理变更已执行的元数据键
pub fn applied_marker_key(job_id: i64, task_id: i64) -> String {
    format!("applied:{job_id}:{task_id}")
}

/// 单条物理语句已执行的元数据键，语句成功后立即提交
pub fn applied_statement_key(job_id: i64, task_id: i64, index: usize) -> String {
    format!("applied:{job_id}:{task_id}:{index}")
}
