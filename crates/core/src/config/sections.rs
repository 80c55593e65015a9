use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::validation::{ConfigValidator, ValidationUtils};
use super::{ConfigError, ConfigResult};
use crate::failpoint::FailPointAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://ddl_engine.db".to_string(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;
        if !self.url.starts_with("sqlite:") {
            return Err(ConfigError::Validation(
                "database.url must start with sqlite:".to_string(),
            ));
        }
        ValidationUtils::validate_count(self.max_connections as usize, "database.max_connections")?;
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Validation(
                "database.min_connections must be less than or equal to max_connections"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(self.connection_timeout_seconds)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 节点标识，同时作为DDL任务租约的持有者
    pub node_id: String,
    /// 同时驱动的DDL任务上限
    pub max_concurrent_jobs: usize,
    /// 单个DDL任务内并发执行的子任务上限
    pub task_parallelism: usize,
    /// 扫描未完成任务的间隔（秒）
    pub scan_interval_seconds: u64,
    /// 任务所有权租约时长（秒）
    pub job_lease_ttl_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: "ddl-node-1".to_string(),
            max_concurrent_jobs: 16,
            task_parallelism: 4,
            scan_interval_seconds: 5,
            job_lease_ttl_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.job_lease_ttl_seconds)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.node_id, "scheduler.node_id")?;
        ValidationUtils::validate_count(self.max_concurrent_jobs, "scheduler.max_concurrent_jobs")?;
        ValidationUtils::validate_count(self.task_parallelism, "scheduler.task_parallelism")?;
        ValidationUtils::validate_timeout_seconds(self.scan_interval_seconds)?;
        ValidationUtils::validate_timeout_seconds(self.job_lease_ttl_seconds)?;
        Ok(())
    }
}

/// 子任务重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 瞬时错误的最大重试次数
    pub max_retries: u32,
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_interval_ms: 200,
            max_interval_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_retries > 100 {
            return Err(ConfigError::Validation(
                "retry.max_retries must be less than or equal to 100".to_string(),
            ));
        }
        if self.base_interval_ms > self.max_interval_ms {
            return Err(ConfigError::Validation(
                "retry.base_interval_ms must be less than or equal to max_interval_ms".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Validation(
                "retry.jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdlConfig {
    /// 获取元数据锁的等待上限（毫秒），超时按瞬时错误处理
    pub lock_timeout_ms: u64,
}

impl Default for MdlConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
        }
    }
}

impl MdlConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl ConfigValidator for MdlConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "mdl.lock_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 单个节点应用同步动作的超时（毫秒）
    pub node_timeout_ms: u64,
    /// 单个节点的最大投递次数
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 3_000,
            max_attempts: 2,
        }
    }
}

impl SyncConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

impl ConfigValidator for SyncConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.node_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sync.node_timeout_ms must be greater than 0".to_string(),
            ));
        }
        ValidationUtils::validate_count(self.max_attempts as usize, "sync.max_attempts")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid output format: {s}. Valid formats: json, pretty"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ConfigValidator for LogConfig {
    fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {}. Valid levels: {:?}",
                self.level, valid_levels
            )));
        }
        Ok(())
    }
}

/// 故障注入配置，仅测试环境开启
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailPointConfig {
    pub enabled: bool,
    /// 注入点名称 -> 动作描述，例如 `"fatal"`、`"suspend:200"`、`"exception*2"`
    pub points: HashMap<String, String>,
}

impl ConfigValidator for FailPointConfig {
    fn validate(&self) -> ConfigResult<()> {
        for (name, spec) in &self.points {
            ValidationUtils::validate_not_empty(name, "failpoint.points key")?;
            FailPointAction::parse(spec).map_err(|e| {
                ConfigError::Validation(format!("failpoint.points.{name}: {e}"))
            })?;
        }
        Ok(())
    }
}
