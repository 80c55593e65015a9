pub mod sqlite_cdc_sink;
pub mod sqlite_job_repository;
pub mod sqlite_lock;
pub mod sqlite_meta_store;
pub mod sqlite_physical_executor;

pub use sqlite_cdc_sink::SqliteCdcSink;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_lock::SqliteDistributedLock;
pub use sqlite_meta_store::SqliteMetaStore;
pub use sqlite_physical_executor::SqlitePhysicalExecutor;
