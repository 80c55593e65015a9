//! 对复制下游的DDL打标通知

pub mod memory_sink;
pub mod notifier;

pub use memory_sink::InMemoryCdcSink;
pub use notifier::CdcNotifier;
