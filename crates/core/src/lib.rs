pub mod config;
pub mod failpoint;
pub mod logging;

pub use config::{
    AppConfig, ConfigError, ConfigResult, ConfigValidator, DatabaseConfig, FailPointConfig,
    LogConfig, LogFormat, MdlConfig, RetryConfig, SchedulerConfig, SyncConfig,
};
pub use ddl_errors::{DdlError, DdlResult};
pub use failpoint::{FailPointAction, FailPoints};
