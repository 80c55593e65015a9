//! 内存实现，用于测试和单进程嵌入式部署

pub mod job_repository;
pub mod lock;
pub mod meta_store;

pub use job_repository::InMemoryJobRepository;
pub use lock::InMemoryDistributedLock;
pub use meta_store::{InMemoryMetaStore, InMemoryMetaTransaction};
