pub mod dag;
pub mod entities;
pub mod events;
pub mod job_query_builder;
pub mod mdl;
pub mod ports;
pub mod repositories;
pub mod sqlx_impls;
pub mod state;

pub use dag::{topological_order, ExecutableJob, JobBuilder, PlannedTask, TaskSpec};
pub use ddl_errors::{DdlError, DdlResult};
pub use entities::*;
pub use events::*;
pub use mdl::*;
pub use ports::*;
pub use repositories::*;
pub use state::reduce_job_state;
