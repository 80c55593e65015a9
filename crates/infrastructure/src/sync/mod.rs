//! 跨节点的表元数据同步

pub mod broadcaster;
pub mod handler;
pub mod node;

pub use broadcaster::{SyncBroadcaster, SyncReport};
pub use handler::SchemaSyncHandler;
pub use node::{LocalSyncNode, StaticNodeRegistry};
