//! 元数据锁（MDL）

pub mod context;
pub mod manager;

pub use context::MdlContext;
pub use manager::MdlManager;
