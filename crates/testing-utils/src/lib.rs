//! # DDL Testing Utils
//!
//! 各个crate共享的测试工具：可观测的协作方替身、测试数据构造器和等待辅助函数。
//!
//! ```toml
//! [dev-dependencies]
//! ddl-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
