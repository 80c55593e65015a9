pub mod cache;
pub mod cdc;
pub mod database;
pub mod error_handling;
pub mod mdl;
pub mod memory;
pub mod observability;
pub mod sync;

pub use cache::{InMemorySchemaCache, SchemaCacheStats};
pub use cdc::{CdcNotifier, InMemoryCdcSink};
pub use database::*;
pub use mdl::{MdlContext, MdlManager};
pub use memory::{InMemoryDistributedLock, InMemoryJobRepository, InMemoryMetaStore};
pub use observability::DdlMetrics;
pub use sync::{LocalSyncNode, SchemaSyncHandler, StaticNodeRegistry, SyncBroadcaster, SyncReport};
