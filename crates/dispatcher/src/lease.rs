use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ddl_domain::{DdlResult, DistributedLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::EngineContext;

/// DDL任务的所有权租约，持有期间在后台定期续约
///
/// 续约失败时只设置丢失标记，由驱动流程在下一轮检查后停止。
/// 销毁时停止续约但不释放租约，模拟崩溃时租约保留到过期。
/// 驱动期间获取的DDL对象锁也登记在这里，随租约一起续约。
pub struct LeaseGuard {
    lock: Arc<dyn DistributedLock>,
    name: String,
    owner: String,
    lost: Arc<AtomicBool>,
    held: Arc<Mutex<Vec<HeldLock>>>,
    renewal: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeldLock {
    name: String,
    owner: String,
}

impl LeaseGuard {
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        job_id: i64,
        owner: &str,
        ttl: Duration,
    ) -> DdlResult<Option<Self>> {
        let name = EngineContext::job_lease_name(job_id);
        if !lock.try_acquire(&name, owner, ttl).await? {
            debug!("租约 {} 由其他节点持有", name);
            return Ok(None);
        }

        let lost = Arc::new(AtomicBool::new(false));
        let held = Arc::new(Mutex::new(vec![HeldLock {
            name: name.clone(),
            owner: owner.to_string(),
        }]));
        let renewal = tokio::spawn(renew_periodically(
            lock.clone(),
            held.clone(),
            ttl,
            lost.clone(),
        ));
        Ok(Some(Self {
            lock,
            name,
            owner: owner.to_string(),
            lost,
            held,
            renewal,
        }))
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// 之后随租约一起续约另一把已获取的锁
    pub fn renew_along(&self, name: &str, owner: &str) {
        let entry = HeldLock {
            name: name.to_string(),
            owner: owner.to_string(),
        };
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.contains(&entry) {
            held.push(entry);
        }
    }

    pub fn stop_renewing(&self, name: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|held| held.name != name);
    }

    pub async fn release(self) {
        self.renewal.abort();
        match self.lock.release(&self.name, &self.owner).await {
            Ok(true) => debug!("释放租约 {}", self.name),
            Ok(false) => warn!("租约 {} 已不属于 {}", self.name, self.owner),
            Err(e) => warn!("释放租约 {} 失败: {}", self.name, e),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

async fn renew_periodically(
    lock: Arc<dyn DistributedLock>,
    held: Arc<Mutex<Vec<HeldLock>>>,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        interval.tick().await;
        let locks = held.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for HeldLock { name, owner } in locks {
            match lock.renew(&name, &owner, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("锁 {} 已不属于 {}，可能已被其他节点接管", name, owner);
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!("续约 {} 失败: {}", name, e);
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}
