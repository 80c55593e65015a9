//! 引擎配置
//!
//! 配置来源按优先级从低到高: 内置默认值 -> TOML配置文件 -> `DDL_ENGINE__*` 环境变量

mod sections;
mod validation;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use sections::{
    DatabaseConfig, FailPointConfig, LogConfig, LogFormat, MdlConfig, RetryConfig,
    SchedulerConfig, SyncConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

/// Configuration error type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("File error: {0}")]
    File(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<ConfigError> for ddl_errors::DdlError {
    fn from(err: ConfigError) -> Self {
        ddl_errors::DdlError::Configuration(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub mdl: MdlConfig,
    pub sync: SyncConfig,
    pub logging: LogConfig,
    pub failpoint: FailPointConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/ddl_engine.toml", "ddl_engine.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("DDL_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.mdl.validate()?;
        self.sync.validate()?;
        self.logging.validate()?;
        self.failpoint.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.scheduler.max_concurrent_jobs, 16);
        assert_eq!(config.retry.max_retries, 3);
        assert!(!config.failpoint.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_partial_toml() {
        let toml_str = r#"
[scheduler]
node_id = "cn-1"
task_parallelism = 8

[mdl]
lock_timeout_ms = 250
"#;
        let config = AppConfig::from_toml(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.scheduler.node_id, "cn-1");
        assert_eq!(config.scheduler.task_parallelism, 8);
        assert_eq!(config.mdl.lock_timeout_ms, 250);
        // 未配置的段落使用默认值
        assert_eq!(config.retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_app_config_rejects_invalid_values() {
        let toml_str = r#"
[scheduler]
task_parallelism = 0
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());

        let toml_str = r#"
[failpoint]
enabled = true
points = { "before_commit:CreatePhysicalTablesTask" = "explode" }
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_app_config_toml_round_trip() {
        let mut config = AppConfig::default();
        config.scheduler.node_id = "cn-2".to_string();
        let serialized = config.to_toml().expect("Failed to serialize");
        let parsed = AppConfig::from_toml(&serialized).expect("Failed to parse");
        assert_eq!(parsed.scheduler.node_id, "cn-2");
    }

    #[test]
    fn test_app_config_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Failed to create temp file");
        writeln!(
            file,
            "[database]\nurl = \"sqlite::memory:\"\n\n[retry]\nmax_retries = 5"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).expect("Failed to load config");
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_app_config_load_missing_file() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
