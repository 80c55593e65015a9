pub mod manager;
pub mod mapping;
pub mod sqlite;

pub use manager::{DatabaseManager, DbPool};
pub use sqlite::{
    SqliteCdcSink, SqliteDistributedLock, SqliteJobRepository, SqliteMetaStore,
    SqlitePhysicalExecutor,
};
