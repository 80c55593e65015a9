//! DDL任务调度与执行
//!
//! 子任务抽象、内置子任务、任务驱动、租约、恢复以及DDL模板。

pub mod context;
pub mod driver;
pub mod executor;
pub mod lease;
pub mod recovery_service;
pub mod registry;
pub mod retry_service;
pub mod scheduler;
pub mod strategies;
pub mod task;
pub mod tasks;

pub use context::{EngineContext, EngineContextBuilder, JobScope, TaskContext};
pub use driver::{DriveExit, JobDriver};
pub use executor::{TaskExecutor, UnitOutcome};
pub use lease::LeaseGuard;
pub use recovery_service::{prepare_for_resume, RecoveryReport};
pub use registry::{TaskFactory, TaskRegistry};
pub use retry_service::RetryPolicy;
pub use scheduler::DdlJobScheduler;
pub use strategies::{DdlJobFactory, DdlRequest, JobTemplate};
pub use task::DdlTask;
