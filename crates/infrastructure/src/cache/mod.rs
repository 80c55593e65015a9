//! 计算节点本地的表元数据缓存

pub mod schema_cache;

pub use schema_cache::{InMemorySchemaCache, SchemaCacheStats};
