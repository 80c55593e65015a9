use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ddl_domain::{table_digest, SchemaCache};
use ddl_errors::DdlResult;
use tracing::debug;

/// 缓存操作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCacheStats {
    pub invalidations: u64,
    pub reloads: u64,
    pub version_bumps: u64,
    pub plan_cache_invalidations: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TableEntry {
    version: u64,
    loaded: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    tables: HashMap<(String, String), TableEntry>,
    plan_cache_generation: HashMap<String, u64>,
    stats: SchemaCacheStats,
}

/// 本节点的表元数据缓存
///
/// 只记录每张表的元数据版本和是否已加载，实际的表定义由外部的元数据存储提供。
#[derive(Debug, Default)]
pub struct InMemorySchemaCache {
    state: Mutex<CacheState>,
}

impl InMemorySchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(schema_name: &str, table_name: &str) -> (String, String) {
        (schema_name.to_lowercase(), table_digest(table_name))
    }

    fn with_entry<F>(&self, schema_name: &str, table_name: &str, f: F)
    where
        F: FnOnce(&mut TableEntry, &mut SchemaCacheStats),
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *state;
        let entry = state
            .tables
            .entry(Self::key(schema_name, table_name))
            .or_default();
        f(entry, &mut state.stats);
    }

    pub fn version(&self, schema_name: &str, table_name: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .tables
            .get(&Self::key(schema_name, table_name))
            .map_or(0, |entry| entry.version)
    }

    pub fn is_loaded(&self, schema_name: &str, table_name: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .tables
            .get(&Self::key(schema_name, table_name))
            .is_some_and(|entry| entry.loaded)
    }

    pub fn plan_cache_generation(&self, schema_name: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .plan_cache_generation
            .get(&schema_name.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> SchemaCacheStats {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }
}

#[async_trait]
impl SchemaCache for InMemorySchemaCache {
    async fn invalidate(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        self.with_entry(schema_name, table_name, |entry, stats| {
            entry.loaded = false;
            stats.invalidations += 1;
        });
        debug!("表元数据缓存失效: {}.{}", schema_name, table_name);
        Ok(())
    }

    async fn reload(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        self.with_entry(schema_name, table_name, |entry, stats| {
            entry.loaded = true;
            stats.reloads += 1;
        });
        debug!("表元数据已重新加载: {}.{}", schema_name, table_name);
        Ok(())
    }

    async fn to_new_version(&self, schema_name: &str, table_name: &str) -> DdlResult<()> {
        self.with_entry(schema_name, table_name, |entry, stats| {
            entry.version += 1;
            entry.loaded = false;
            stats.version_bumps += 1;
        });
        debug!("表元数据切换到新版本: {}.{}", schema_name, table_name);
        Ok(())
    }

    async fn invalidate_plan_cache(&self, schema_name: &str) -> DdlResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state
            .plan_cache_generation
            .entry(schema_name.to_lowercase())
            .or_default() += 1;
        state.stats.plan_cache_invalidations += 1;
        Ok(())
    }
}
