use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ddl_domain::{MetaStore, MetaTransaction};
use ddl_errors::DdlResult;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Default)]
struct MetaInner {
    data: Mutex<BTreeMap<String, Value>>,
    next_trx_id: AtomicU64,
    commits: AtomicU64,
}

/// 内存元数据存储，`Clone` 得到的实例共享同一份数据
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetaStore {
    inner: Arc<MetaInner>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已提交的事务数
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    fn read(&self, key: &str) -> Option<Value> {
        let data = self.inner.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(key).cloned()
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn begin(&self) -> DdlResult<Box<dyn MetaTransaction>> {
        let trx_id = self.inner.next_trx_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(InMemoryMetaTransaction {
            store: self.clone(),
            trx_id,
            staged: HashMap::new(),
        }))
    }

    async fn get(&self, key: &str) -> DdlResult<Option<Value>> {
        Ok(self.read(key))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> DdlResult<Vec<String>> {
        let data = self.inner.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

pub struct InMemoryMetaTransaction {
    store: InMemoryMetaStore,
    trx_id: u64,
    staged: HashMap<String, Option<Value>>,
}

#[async_trait]
impl MetaTransaction for InMemoryMetaTransaction {
    fn trx_id(&self) -> u64 {
        self.trx_id
    }

    async fn get(&mut self, key: &str) -> DdlResult<Option<Value>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.store.read(key)),
        }
    }

    async fn put(&mut self, key: &str, value: Value) -> DdlResult<()> {
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> DdlResult<bool> {
        let existed = self.get(key).await?.is_some();
        self.staged.insert(key.to_string(), None);
        Ok(existed)
    }

    async fn commit(self: Box<Self>) -> DdlResult<()> {
        let this = *self;
        {
            let mut data = this
                .store
                .inner
                .data
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (key, value) in this.staged {
                match value {
                    Some(value) => {
                        data.insert(key, value);
                    }
                    None => {
                        data.remove(&key);
                    }
                }
            }
        }
        this.store.inner.commits.fetch_add(1, Ordering::SeqCst);
        debug!(trx_id = this.trx_id, "元数据事务已提交");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DdlResult<()> {
        debug!(trx_id = self.trx_id, "元数据事务已回滚");
        Ok(())
    }
}
