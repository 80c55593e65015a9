//! DDL任务的子任务DAG
//!
//! `JobBuilder` 在提交前构造DAG，`build` 之后得到不可变的 `ExecutableJob`。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use ddl_errors::{DdlError, DdlResult};
use serde::{Deserialize, Serialize};

use crate::entities::{DdlType, Job, JobState, TaskRecord, TaskState};

/// 基于Kahn算法的拓扑排序，入度相同的节点按task_id升序输出
pub fn topological_order<'a, I>(nodes: I) -> DdlResult<Vec<i64>>
where
    I: IntoIterator<Item = (i64, &'a [i64])>,
{
    let mut in_degree: HashMap<i64, usize> = HashMap::new();
    let mut successors: HashMap<i64, Vec<i64>> = HashMap::new();

    let nodes: Vec<(i64, &[i64])> = nodes.into_iter().collect();
    for (id, _) in &nodes {
        in_degree.insert(*id, 0);
    }
    for (id, predecessors) in &nodes {
        for pred in predecessors.iter() {
            if !in_degree.contains_key(pred) {
                return Err(DdlError::InvalidDependency {
                    task_id: *id,
                    dependency_id: *pred,
                    reason: "依赖的子任务不存在".to_string(),
                });
            }
            successors.entry(*pred).or_default().push(*id);
            *in_degree.entry(*id).or_insert(0) += 1;
        }
    }

    let mut queue: BinaryHeap<Reverse<i64>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(id)) = queue.pop() {
        order.push(id);
        if let Some(next) = successors.get(&id) {
            for succ in next {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(Reverse(*succ));
                    }
                }
            }
        }
    }

    if order.len() < in_degree.len() {
        let remaining: Vec<i64> = in_degree
            .keys()
            .filter(|id| !order.contains(id))
            .copied()
            .collect();
        return Err(DdlError::CircularDependency(format!(
            "子任务 {remaining:?} 之间存在循环依赖"
        )));
    }
    Ok(order)
}

/// 待加入DAG的子任务描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    pub params: serde_json::Value,
    pub remark: Option<String>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            params,
            remark: None,
        }
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub task_id: i64,
    pub task_type: String,
    pub params: serde_json::Value,
    pub remark: Option<String>,
    pub predecessor_ids: Vec<i64>,
    pub transaction_group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobBuilder {
    schema_name: String,
    ddl_type: DdlType,
    ddl_stmt: String,
    trace_id: Option<String>,
    tasks: Vec<PlannedTask>,
    invalid_edges: Vec<(i64, i64)>,
}

impl JobBuilder {
    pub fn new(
        schema_name: impl Into<String>,
        ddl_type: DdlType,
        ddl_stmt: impl Into<String>,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            ddl_type,
            ddl_stmt: ddl_stmt.into(),
            trace_id: None,
            tasks: Vec::new(),
            invalid_edges: Vec::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// 添加子任务，返回按添加顺序分配的task_id（从1开始）
    pub fn add_task(&mut self, spec: TaskSpec) -> i64 {
        let task_id = self.tasks.len() as i64 + 1;
        self.tasks.push(PlannedTask {
            task_id,
            task_type: spec.task_type,
            params: spec.params,
            remark: spec.remark,
            predecessor_ids: Vec::new(),
            transaction_group: None,
        });
        task_id
    }

    /// `to` 依赖 `from`
    pub fn add_edge(&mut self, from: i64, to: i64) -> &mut Self {
        match self.task_index(to) {
            Some(index) if from != to && self.task_index(from).is_some() => {
                let preds = &mut self.tasks[index].predecessor_ids;
                if !preds.contains(&from) {
                    preds.push(from);
                }
            }
            _ => self.invalid_edges.push((from, to)),
        }
        self
    }

    /// 依次串联已添加的子任务
    pub fn add_chain(&mut self, task_ids: &[i64]) -> &mut Self {
        for pair in task_ids.windows(2) {
            self.add_edge(pair[0], pair[1]);
        }
        self
    }

    /// 追加一串顺序执行的子任务，第一个接在 `after` 之后
    pub fn add_sequence(&mut self, after: Option<i64>, specs: Vec<TaskSpec>) -> Vec<i64> {
        let mut ids = Vec::with_capacity(specs.len());
        let mut previous = after;
        for spec in specs {
            let id = self.add_task(spec);
            if let Some(prev) = previous {
                self.add_edge(prev, id);
            }
            previous = Some(id);
            ids.push(id);
        }
        ids
    }

    /// 同一事务组的子任务在同一个元数据事务中执行并一起提交
    pub fn set_transaction_group(&mut self, task_ids: &[i64], group: &str) -> &mut Self {
        for id in task_ids {
            if let Some(index) = self.task_index(*id) {
                self.tasks[index].transaction_group = Some(group.to_string());
            }
        }
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn build(self) -> DdlResult<ExecutableJob> {
        if self.tasks.is_empty() {
            return Err(DdlError::validation_error("DDL任务至少需要一个子任务"));
        }
        if let Some((from, to)) = self.invalid_edges.first() {
            return Err(DdlError::InvalidDependency {
                task_id: *to,
                dependency_id: *from,
                reason: "依赖的子任务不存在或依赖自身".to_string(),
            });
        }
        for task in &self.tasks {
            if task.task_type.trim().is_empty() {
                return Err(DdlError::validation_error(format!(
                    "子任务 {} 缺少任务类型",
                    task.task_id
                )));
            }
        }

        let order = topological_order(
            self.tasks
                .iter()
                .map(|t| (t.task_id, t.predecessor_ids.as_slice())),
        )?;
        validate_transaction_groups(&self.tasks, &order)?;

        Ok(ExecutableJob {
            schema_name: self.schema_name,
            ddl_type: self.ddl_type,
            ddl_stmt: self.ddl_stmt,
            trace_id: self
                .trace_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            tasks: self.tasks,
            order,
        })
    }

    fn task_index(&self, task_id: i64) -> Option<usize> {
        if task_id >= 1 && (task_id as usize) <= self.tasks.len() {
            Some(task_id as usize - 1)
        } else {
            None
        }
    }
}

/// 事务组成员必须按拓扑顺序构成一条链，且只有链首可以依赖组外子任务
fn validate_transaction_groups(tasks: &[PlannedTask], order: &[i64]) -> DdlResult<()> {
    let mut groups: HashMap<&str, Vec<&PlannedTask>> = HashMap::new();
    for id in order {
        if let Some(task) = tasks.iter().find(|t| t.task_id == *id) {
            if let Some(group) = task.transaction_group.as_deref() {
                groups.entry(group).or_default().push(task);
            }
        }
    }

    for (group, members) in groups {
        let member_ids: HashSet<i64> = members.iter().map(|t| t.task_id).collect();
        for pair in members.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if !next.predecessor_ids.contains(&prev.task_id) {
                return Err(DdlError::InvalidDependency {
                    task_id: next.task_id,
                    dependency_id: prev.task_id,
                    reason: format!("事务组 {group} 的成员必须构成一条链"),
                });
            }
            if let Some(outside) = next
                .predecessor_ids
                .iter()
                .find(|p| !member_ids.contains(p))
            {
                return Err(DdlError::InvalidDependency {
                    task_id: next.task_id,
                    dependency_id: *outside,
                    reason: format!("事务组 {group} 只有第一个成员可以依赖组外子任务"),
                });
            }
        }
    }
    Ok(())
}

/// 构造完成、不可再修改的DDL任务
#[derive(Debug, Clone)]
pub struct ExecutableJob {
    schema_name: String,
    ddl_type: DdlType,
    ddl_stmt: String,
    trace_id: String,
    tasks: Vec<PlannedTask>,
    order: Vec<i64>,
}

impl ExecutableJob {
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn ddl_type(&self) -> DdlType {
        self.ddl_type
    }

    pub fn ddl_stmt(&self) -> &str {
        &self.ddl_stmt
    }

    /// 未指定时在构造时生成
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn tasks(&self) -> &[PlannedTask] {
        &self.tasks
    }

    pub fn topological_order(&self) -> &[i64] {
        &self.order
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.task_type.as_str())
    }

    /// 存储分配job_id之后得到的初始状态：任务QUEUED，子任务全部READY
    pub fn to_queued_job(&self, job_id: i64, now: DateTime<Utc>) -> Job {
        let tasks = self
            .tasks
            .iter()
            .map(|planned| TaskRecord {
                task_id: planned.task_id,
                job_id,
                task_type: planned.task_type.clone(),
                state: TaskState::Ready,
                params: planned.params.clone(),
                predecessor_ids: planned.predecessor_ids.clone(),
                remark: planned.remark.clone(),
                transaction_group: planned.transaction_group.clone(),
                retry_count: 0,
                error_message: None,
                update_time: now,
            })
            .collect();

        Job {
            job_id,
            schema_name: self.schema_name.clone(),
            ddl_type: self.ddl_type,
            ddl_stmt: self.ddl_stmt.clone(),
            state: JobState::Queued,
            tasks,
            create_time: now,
            update_time: now,
            trace_id: self.trace_id.clone(),
            error_message: None,
            cancel_requested: false,
        }
    }
}
