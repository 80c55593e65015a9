use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ddl_domain::DistributedLock;
use ddl_errors::DdlResult;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// 进程内的租约锁
#[derive(Debug, Default)]
pub struct InMemoryDistributedLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases
            .get(name)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.owner.clone())
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> DdlResult<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let available = match leases.get(name) {
            Some(lease) => lease.owner == owner || lease.expires_at <= now,
            None => true,
        };
        if available {
            leases.insert(
                name.to_string(),
                Lease {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(available)
    }

    async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> DdlResult<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(name) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> DdlResult<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get(name) {
            Some(lease) if lease.owner == owner => {
                leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
