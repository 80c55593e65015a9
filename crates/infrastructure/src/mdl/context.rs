use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ddl_domain::{MdlDuration, MdlKey, MdlRequest, MdlTicket};
use ddl_errors::DdlResult;
use tracing::debug;

use super::MdlManager;

/// 一个持有者名下的锁集合，销毁时释放全部锁（包括错误路径）
pub struct MdlContext {
    manager: Arc<MdlManager>,
    owner: String,
    tickets: Mutex<Vec<MdlTicket>>,
}

impl MdlContext {
    pub fn new(manager: Arc<MdlManager>, owner: impl Into<String>) -> Self {
        Self {
            manager,
            owner: owner.into(),
            tickets: Mutex::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn acquire(&self, request: &MdlRequest, timeout: Duration) -> DdlResult<MdlTicket> {
        let ticket = self.manager.acquire(&self.owner, request, timeout).await?;
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ticket.clone());
        Ok(ticket)
    }

    pub fn release(&self, ticket: &MdlTicket) -> bool {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|held| held.ticket_id != ticket.ticket_id);
        self.manager.release(ticket)
    }

    /// 元数据事务结束时释放该事务的TRANSACTION级别锁
    pub fn release_transactional_locks(&self, trx_id: u64) -> usize {
        self.release_where(|t| t.duration == MdlDuration::Transaction && t.trx_id == trx_id)
    }

    /// 释放某个键上的INSTANCE级别锁
    pub fn release_instance_locks(&self, key: &MdlKey) -> usize {
        self.release_where(|t| t.duration == MdlDuration::Instance && &t.key == key)
    }

    pub fn release_all(&self) -> usize {
        self.release_where(|_| true)
    }

    pub fn held(&self) -> Vec<MdlTicket> {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn release_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&MdlTicket) -> bool,
    {
        let released: Vec<MdlTicket> = {
            let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
            let (matched, kept) = tickets.drain(..).partition(|t| predicate(t));
            *tickets = kept;
            matched
        };
        for ticket in &released {
            self.manager.release(ticket);
        }
        released.len()
    }
}

impl Drop for MdlContext {
    fn drop(&mut self) {
        let count = self.release_all();
        if count > 0 {
            debug!(owner = %self.owner, count, "上下文销毁，释放元数据锁");
        }
    }
}
