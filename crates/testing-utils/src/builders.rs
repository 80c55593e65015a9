//! 测试数据构造器

use ddl_domain::{DdlType, ExecutableJob, JobBuilder, TaskSpec};
use serde_json::Value;

/// 按顺序串联的DDL任务
pub fn chain_job(ddl_type: DdlType, tasks: Vec<(&str, Value)>) -> ExecutableJob {
    let mut builder = JobBuilder::new("db1", ddl_type, format!("{ddl_type} t1"));
    builder.add_sequence(
        None,
        tasks
            .into_iter()
            .map(|(task_type, params)| TaskSpec::new(task_type, params))
            .collect(),
    );
    builder.build().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_job_orders_tasks() {
        let job = chain_job(
            DdlType::CreateTable,
            vec![("A", json!({})), ("B", json!({})), ("C", json!({}))],
        );
        assert_eq!(job.topological_order(), &[1, 2, 3]);
    }
}
