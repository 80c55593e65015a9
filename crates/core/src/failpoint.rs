//! 故障注入
//!
//! `FailPoints` 是显式传入引擎的能力对象，只在约定的注入点被检查。
//! 默认处于关闭状态，关闭时所有注入点都是空操作。
//! 配置文件只有在启用 `failpoints` 特性的构建中才能配置 `crash` 动作。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ddl_errors::{DdlError, DdlResult};
use tracing::{debug, warn};

use crate::config::FailPointConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPointAction {
    /// 可重试的模拟错误
    Exception,
    /// 不可重试的模拟错误，触发任务回滚
    FatalException,
    Suspend(Duration),
    /// 模拟进程崩溃：任务驱动立即退出，不再持久化任何状态
    Crash,
}

impl FailPointAction {
    /// 解析动作描述，格式为 `action[:millis][*times]`，返回动作和可选的触发次数
    pub fn parse(spec: &str) -> Result<(Self, Option<u32>), String> {
        let spec = spec.trim();
        let (action, times) = match spec.split_once('*') {
            Some((action, times)) => {
                let times = times
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| format!("无效的触发次数: {times}"))?;
                if times == 0 {
                    return Err("触发次数必须大于0".to_string());
                }
                (action.trim(), Some(times))
            }
            None => (spec, None),
        };

        let action = match action.split_once(':') {
            Some(("suspend", millis)) => {
                let millis = millis
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("无效的挂起时长: {millis}"))?;
                FailPointAction::Suspend(Duration::from_millis(millis))
            }
            Some(_) => return Err(format!("无效的故障注入动作: {action}")),
            None => match action {
                "exception" => FailPointAction::Exception,
                "fatal" => FailPointAction::FatalException,
                "crash" => FailPointAction::Crash,
                _ => return Err(format!("无效的故障注入动作: {action}")),
            },
        };

        Ok((action, times))
    }

    fn is_suspend(&self) -> bool {
        matches!(self, FailPointAction::Suspend(_))
    }
}

#[derive(Debug, Clone)]
struct ArmedPoint {
    action: FailPointAction,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct FailPointsInner {
    enabled: bool,
    points: Mutex<HashMap<String, ArmedPoint>>,
    hits: Mutex<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Default)]
pub struct FailPoints {
    inner: Arc<FailPointsInner>,
}

impl FailPoints {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self {
            inner: Arc::new(FailPointsInner {
                enabled: true,
                ..Default::default()
            }),
        }
    }

    pub fn from_config(config: &FailPointConfig) -> DdlResult<Self> {
        if !config.enabled {
            if !config.points.is_empty() {
                warn!("故障注入未启用，忽略 {} 个配置的注入点", config.points.len());
            }
            return Ok(Self::disabled());
        }

        let failpoints = Self::enabled();
        for (name, spec) in &config.points {
            let (action, times) = FailPointAction::parse(spec).map_err(|e| {
                DdlError::Configuration(format!("failpoint.points.{name}: {e}"))
            })?;
            if action == FailPointAction::Crash && !cfg!(feature = "failpoints") {
                return Err(DdlError::Configuration(format!(
                    "failpoint.points.{name}: crash 动作需要启用 failpoints 特性"
                )));
            }
            failpoints.arm_times(name, action, times);
        }
        Ok(failpoints)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn arm(&self, name: &str, action: FailPointAction) {
        self.arm_times(name, action, None);
    }

    /// `times` 为 `None` 时注入点一直生效，直到被 `disarm`
    pub fn arm_times(&self, name: &str, action: FailPointAction, times: Option<u32>) {
        if !self.inner.enabled {
            warn!("故障注入未启用，忽略注入点: {}", name);
            return;
        }
        debug!("启用故障注入点: {} -> {:?}", name, action);
        self.points().insert(
            name.to_string(),
            ArmedPoint {
                action,
                remaining: times,
            },
        );
    }

    pub fn disarm(&self, name: &str) {
        self.points().remove(name);
    }

    pub fn clear(&self) {
        self.points().clear();
    }

    /// 注入点实际触发的次数
    pub fn hits(&self, name: &str) -> u32 {
        self.inner
            .hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// 错误类注入点：返回模拟错误，挂起类动作在这里不生效
    pub fn inject_exception(&self, name: &str) -> DdlResult<()> {
        match self.take(name, |action| !action.is_suspend()) {
            Some(FailPointAction::Exception) => Err(DdlError::FailPointInjected {
                name: name.to_string(),
                fatal: false,
            }),
            Some(FailPointAction::FatalException) => Err(DdlError::FailPointInjected {
                name: name.to_string(),
                fatal: true,
            }),
            Some(FailPointAction::Crash) => Err(DdlError::SimulatedCrash(name.to_string())),
            Some(FailPointAction::Suspend(_)) | None => Ok(()),
        }
    }

    pub async fn inject_suspend(&self, name: &str) {
        if let Some(FailPointAction::Suspend(duration)) = self.take(name, FailPointAction::is_suspend)
        {
            debug!("故障注入点 {} 挂起 {:?}", name, duration);
            tokio::time::sleep(duration).await;
        }
    }

    /// 同时检查挂起与错误两类动作
    pub async fn inject(&self, name: &str) -> DdlResult<()> {
        if !self.inner.enabled {
            return Ok(());
        }
        self.inject_suspend(name).await;
        self.inject_exception(name)
    }

    fn take(
        &self,
        name: &str,
        filter: impl Fn(&FailPointAction) -> bool,
    ) -> Option<FailPointAction> {
        if !self.inner.enabled {
            return None;
        }

        let action = {
            let mut points = self.points();
            let point = points.get_mut(name)?;
            if !filter(&point.action) {
                return None;
            }
            let action = point.action;
            if let Some(remaining) = point.remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    points.remove(name);
                }
            }
            action
        };

        *self
            .inner
            .hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(0) += 1;
        warn!("触发故障注入点: {} -> {:?}", name, action);
        Some(action)
    }

    fn points(&self) -> std::sync::MutexGuard<'_, HashMap<String, ArmedPoint>> {
        self.inner
            .points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
