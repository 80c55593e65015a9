use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use ddl_domain::{MdlKey, MdlRequest, MdlTicket};
use ddl_errors::{DdlError, DdlResult};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct MdlState {
    next_ticket_id: u64,
    granted: HashMap<MdlKey, Vec<MdlTicket>>,
}

impl MdlState {
    /// 同一持有者的锁互相兼容（可重入），不同持有者按模式判断
    fn is_grantable(&self, owner: &str, request: &MdlRequest) -> bool {
        self.granted.get(&request.key).map_or(true, |holders| {
            holders
                .iter()
                .all(|held| held.owner == owner || held.mode.is_compatible_with(request.mode))
        })
    }
}

/// 进程内的元数据锁管理器
///
/// 等待者在每次释放时被唤醒并重新检查兼容性，超时返回可重试的 `LockTimeout`。
#[derive(Debug, Default)]
pub struct MdlManager {
    state: Mutex<MdlState>,
    released: Notify,
}

impl MdlManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        owner: &str,
        request: &MdlRequest,
        timeout: Duration,
    ) -> DdlResult<MdlTicket> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // 先登记等待，再检查状态，避免错过检查与等待之间发生的释放
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ticket) = self.try_grant(owner, request) {
                return Ok(ticket);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(
                    key = %request.key,
                    owner = %owner,
                    mode = ?request.mode,
                    waited_ms,
                    "等待元数据锁超时"
                );
                return Err(DdlError::LockTimeout {
                    key: request.key.to_string(),
                    waited_ms,
                });
            }
        }
    }

    /// 不等待，立即判断能否授予
    pub fn try_grant(&self, owner: &str, request: &MdlRequest) -> Option<MdlTicket> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_grantable(owner, request) {
            return None;
        }
        state.next_ticket_id += 1;
        let ticket = MdlTicket {
            ticket_id: state.next_ticket_id,
            owner: owner.to_string(),
            trx_id: request.trx_id,
            key: request.key.clone(),
            mode: request.mode,
            duration: request.duration,
        };
        state
            .granted
            .entry(request.key.clone())
            .or_default()
            .push(ticket.clone());
        debug!(key = %ticket.key, owner = %owner, mode = ?ticket.mode, "授予元数据锁");
        Some(ticket)
    }

    /// 释放锁，重复释放返回false
    pub fn release(&self, ticket: &MdlTicket) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(holders) = state.granted.get_mut(&ticket.key) else {
                return false;
            };
            let before = holders.len();
            holders.retain(|held| held.ticket_id != ticket.ticket_id);
            let removed = holders.len() != before;
            if holders.is_empty() {
                state.granted.remove(&ticket.key);
            }
            removed
        };

        if removed {
            debug!(key = %ticket.key, owner = %ticket.owner, "释放元数据锁");
            self.released.notify_waiters();
        }
        removed
    }

    pub fn holders(&self, key: &MdlKey) -> Vec<MdlTicket> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.granted.get(key).cloned().unwrap_or_default()
    }

    pub fn is_locked(&self, key: &MdlKey) -> bool {
        !self.holders(key).is_empty()
    }

    pub fn granted_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.granted.values().map(Vec::len).sum()
    }
}
