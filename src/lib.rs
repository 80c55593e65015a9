//! 分布式DDL任务执行引擎的组装层：SQLite存储上的调度器和优雅关闭

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
