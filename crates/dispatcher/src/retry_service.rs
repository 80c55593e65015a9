use std::time::Duration;

use ddl_core::RetryConfig;
use ddl_errors::DdlError;

/// 子任务粒度的重试策略：指数退避、封顶并带随机抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// 只有瞬时错误且未超过最大重试次数时才重试
    pub fn should_retry(&self, error: &DdlError, retry_count: u32) -> bool {
        error.is_retryable() && retry_count < self.config.max_retries
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base_interval = self.config.base_interval_ms as f64;
        let multiplier = self.config.backoff_multiplier;
        let max_interval = self.config.max_interval_ms as f64;
        let jitter_factor = self.config.jitter_factor;

        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let exponential_interval = base_interval * multiplier.powi(exponent);
        let capped_interval = exponential_interval.min(max_interval);

        // 随机抖动避免多个子任务同时重试
        let jitter = capped_interval * jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).clamp(0.0, max_interval);

        Duration::from_millis(final_interval as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
