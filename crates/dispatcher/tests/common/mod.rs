#![allow(dead_code)]

use ddl_core::FailPoints;
use ddl_dispatcher::{DdlRequest, EngineContext};
use ddl_domain::PhysicalStatement;
use ddl_testing_utils::{TestEnv, TestStores};

/// 在共享存储上组装一个节点的引擎
pub fn engine(stores: &TestStores, node_id: &str, failpoints: FailPoints) -> EngineContext {
    builder(stores, node_id, failpoints).build()
}

pub fn builder(
    stores: &TestStores,
    node_id: &str,
    failpoints: FailPoints,
) -> ddl_dispatcher::EngineContextBuilder {
    EngineContext::builder(node_id)
        .repository(stores.repository())
        .meta_store(stores.meta_store())
        .lease(stores.lease())
        .cdc_notifier(stores.cdc_notifier())
        .physical_executor(stores.physical.clone())
        .schema_cache(stores.schema_cache.clone())
        .mdl_manager(stores.mdl.clone())
        .failpoints(failpoints)
        .scheduler_config(TestEnv::scheduler_config(node_id))
        .retry_config(TestEnv::retry_config(3))
        .mdl_config(TestEnv::mdl_config())
}

pub fn create_sql(table: &str, shard: usize) -> String {
    format!("CREATE TABLE {table}_{shard} (id INT)")
}

pub fn drop_sql(table: &str, shard: usize) -> String {
    format!("DROP TABLE IF EXISTS {table}_{shard}")
}

/// 两个分片上的建表请求，回滚语句删除物理表
pub fn create_table(table: &str) -> DdlRequest {
    DdlRequest::new("db1", table, format!("CREATE TABLE {table} (id INT)")).with_physical(
        (0..2)
            .map(|i| PhysicalStatement::new(format!("g{i}"), create_sql(table, i)))
            .collect(),
        (0..2)
            .map(|i| PhysicalStatement::new(format!("g{i}"), drop_sql(table, i)))
            .collect(),
    )
}

pub fn drop_table(table: &str) -> DdlRequest {
    DdlRequest::new("db1", table, format!("DROP TABLE {table}")).with_physical(
        (0..2)
            .map(|i| PhysicalStatement::new(format!("g{i}"), drop_sql(table, i)))
            .collect(),
        Vec::new(),
    )
}

pub fn alter_sql(table: &str, shard: usize, column: &str) -> String {
    format!("ALTER TABLE {table}_{shard} ADD COLUMN {column} INT")
}

/// 两个分片上的加列请求，回滚语句删除新加的列
pub fn alter_table(table: &str, column: &str) -> DdlRequest {
    DdlRequest::new(
        "db1",
        table,
        format!("ALTER TABLE {table} ADD COLUMN {column} INT"),
    )
    .with_physical(
        (0..2)
            .map(|i| PhysicalStatement::new(format!("g{i}"), alter_sql(table, i, column)))
            .collect(),
        (0..2)
            .map(|i| {
                PhysicalStatement::new(
                    format!("g{i}"),
                    format!("ALTER TABLE {table}_{i} DROP COLUMN IF EXISTS {column}"),
                )
            })
            .collect(),
    )
}
