use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MdlMode {
    Shared,
    Exclusive,
}

impl MdlMode {
    pub fn is_compatible_with(&self, other: MdlMode) -> bool {
        matches!((self, other), (MdlMode::Shared, MdlMode::Shared))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MdlDuration {
    /// 随元数据事务结束释放
    Transaction,
    /// 跨事务持有，直到显式释放或上下文销毁
    Instance,
}

/// 元数据锁的键，库名和表名不区分大小写
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MdlKey {
    pub schema_name: String,
    pub table_digest: String,
}

impl MdlKey {
    pub fn new(schema_name: &str, table_name: &str) -> Self {
        Self {
            schema_name: schema_name.to_lowercase(),
            table_digest: table_digest(table_name),
        }
    }
}

impl fmt::Display for MdlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_digest)
    }
}

/// 表名的稳定摘要，同一张表在所有节点上得到相同结果（去掉引号并转小写）
pub fn table_digest(table_name: &str) -> String {
    table_name.trim().trim_matches('`').to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdlRequest {
    pub trx_id: u64,
    pub key: MdlKey,
    pub mode: MdlMode,
    pub duration: MdlDuration,
}

impl MdlRequest {
    pub fn new(trx_id: u64, key: MdlKey, mode: MdlMode, duration: MdlDuration) -> Self {
        Self {
            trx_id,
            key,
            mode,
            duration,
        }
    }

    pub fn exclusive(trx_id: u64, schema_name: &str, table_name: &str) -> Self {
        Self::new(
            trx_id,
            MdlKey::new(schema_name, table_name),
            MdlMode::Exclusive,
            MdlDuration::Transaction,
        )
    }

    pub fn shared(trx_id: u64, schema_name: &str, table_name: &str) -> Self {
        Self::new(
            trx_id,
            MdlKey::new(schema_name, table_name),
            MdlMode::Shared,
            MdlDuration::Transaction,
        )
    }

    pub fn with_duration(mut self, duration: MdlDuration) -> Self {
        self.duration = duration;
        self
    }
}

/// 已授予的锁
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MdlTicket {
    pub ticket_id: u64,
    pub owner: String,
    pub trx_id: u64,
    pub key: MdlKey,
    pub mode: MdlMode,
    pub duration: MdlDuration,
}
