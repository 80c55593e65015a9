//! DDL语句到任务DAG的映射
//!
//! 每种 `DdlType` 对应一个模板，模板只负责把请求展开成子任务和依赖关系，
//! 子任务的执行语义由任务注册表中的实现决定。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ddl_domain::{
    DdlError, DdlResult, DdlType, DdlVisibility, ExecutableJob, JobBuilder, PhysicalStatement,
    SyncAction, TaskSpec, TABLE_NEW_NAME, TABLE_NEW_PATTERN,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tasks::{
    AcquireMdlTask, AlterPhysicalTablesTask, CdcMarkTask, CreatePhysicalTablesTask,
    DropPhysicalTablesTask, MetaAction, PhysicalStatements, SyncSchemaTask, UpdateTableMetaTask,
    ValidateTableTask,
};

/// 一条已解析的逻辑DDL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DdlRequest {
    pub schema_name: String,
    pub table_name: String,
    pub ddl_stmt: String,
    #[serde(default)]
    pub physical_statements: Vec<PhysicalStatement>,
    #[serde(default)]
    pub rollback_statements: Vec<PhysicalStatement>,
    /// RENAME TABLE 的目标表名
    #[serde(default)]
    pub new_table_name: Option<String>,
    /// 改名后物理表的命名模式，缺省与目标表名相同
    #[serde(default)]
    pub new_table_pattern: Option<String>,
    #[serde(default)]
    pub index_name: Option<String>,
    /// REPARTITION 时随主表一起重载的全局二级索引表
    #[serde(default)]
    pub gsi_table: Option<String>,
    #[serde(default)]
    pub visibility: DdlVisibility,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl DdlRequest {
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        ddl_stmt: impl Into<String>,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            ddl_stmt: ddl_stmt.into(),
            ..Default::default()
        }
    }

    pub fn with_physical(
        mut self,
        statements: Vec<PhysicalStatement>,
        rollback_statements: Vec<PhysicalStatement>,
    ) -> Self {
        self.physical_statements = statements;
        self.rollback_statements = rollback_statements;
        self
    }

    pub fn with_new_table_name(mut self, new_table_name: impl Into<String>) -> Self {
        self.new_table_name = Some(new_table_name.into());
        self
    }

    pub fn with_new_table_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.new_table_pattern = Some(pattern.into());
        self
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = Some(index_name.into());
        self
    }

    pub fn with_gsi_table(mut self, gsi_table: impl Into<String>) -> Self {
        self.gsi_table = Some(gsi_table.into());
        self
    }

    pub fn with_visibility(mut self, visibility: DdlVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    fn physical(&self, with_rollback: bool) -> PhysicalStatements {
        PhysicalStatements {
            table_name: self.table_name.clone(),
            statements: self.physical_statements.clone(),
            rollback_statements: if with_rollback {
                self.rollback_statements.clone()
            } else {
                Vec::new()
            },
        }
    }

    fn remark(&self) -> String {
        format!("|logicalTableName: {}", self.table_name)
    }

    fn require_new_table_name(&self) -> DdlResult<&str> {
        match self.new_table_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(DdlError::validation_error("RENAME TABLE 缺少目标表名")),
        }
    }

    fn require_index_name(&self) -> DdlResult<&str> {
        match self.index_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(DdlError::validation_error("索引DDL缺少索引名")),
        }
    }
}

/// 把一种DDL展开成子任务
pub trait JobTemplate: Send + Sync {
    fn ddl_type(&self) -> DdlType;

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()>;
}

fn spec<T: Serialize>(task_type: &str, task: &T, remark: String) -> DdlResult<TaskSpec> {
    Ok(TaskSpec::new(task_type, serde_json::to_value(task)?).with_remark(remark))
}

fn validate(table_name: &str, should_exist: bool) -> DdlResult<TaskSpec> {
    spec(
        ValidateTableTask::TYPE,
        &ValidateTableTask {
            table_name: table_name.to_string(),
            should_exist,
        },
        format!("|logicalTableName: {table_name}"),
    )
}

fn acquire_mdl(request: &DdlRequest) -> DdlResult<TaskSpec> {
    spec(
        AcquireMdlTask::TYPE,
        &AcquireMdlTask {
            table_name: request.table_name.clone(),
        },
        request.remark(),
    )
}

fn update_meta(request: &DdlRequest, action: MetaAction) -> DdlResult<TaskSpec> {
    spec(
        UpdateTableMetaTask::TYPE,
        &UpdateTableMetaTask {
            table_name: request.table_name.clone(),
            action,
        },
        request.remark(),
    )
}

fn cdc_mark(
    request: &DdlRequest,
    extra_params: BTreeMap<String, serde_json::Value>,
) -> DdlResult<TaskSpec> {
    spec(
        CdcMarkTask::TYPE,
        &CdcMarkTask {
            table_name: request.table_name.clone(),
            ddl_kind: None,
            visibility: request.visibility,
            extra_params,
        },
        request.remark(),
    )
}

fn sync(request: &DdlRequest, action: SyncAction) -> DdlResult<TaskSpec> {
    spec(SyncSchemaTask::TYPE, &SyncSchemaTask { action }, request.remark())
}

fn invalidate(request: &DdlRequest, table_name: &str) -> SyncAction {
    SyncAction::InvalidateTable {
        schema_name: request.schema_name.clone(),
        table_name: table_name.to_string(),
    }
}

fn reload(request: &DdlRequest) -> SyncAction {
    SyncAction::ReloadTable {
        schema_name: request.schema_name.clone(),
        table_name: request.table_name.clone(),
    }
}

pub struct CreateTableTemplate;

impl JobTemplate for CreateTableTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::CreateTable
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, false)?,
                acquire_mdl(request)?,
                spec(
                    CreatePhysicalTablesTask::TYPE,
                    &CreatePhysicalTablesTask {
                        physical: request.physical(true),
                    },
                    request.remark(),
                )?,
                update_meta(request, MetaAction::Register)?,
                cdc_mark(request, BTreeMap::new())?,
                sync(request, invalidate(request, &request.table_name))?,
            ],
        );
        Ok(())
    }
}

pub struct AlterTableTemplate;

impl JobTemplate for AlterTableTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::AlterTable
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, true)?,
                acquire_mdl(request)?,
                spec(
                    AlterPhysicalTablesTask::TYPE,
                    &AlterPhysicalTablesTask {
                        physical: request.physical(true),
                    },
                    request.remark(),
                )?,
                update_meta(request, MetaAction::BumpVersion)?,
                cdc_mark(request, BTreeMap::new())?,
                sync(request, reload(request))?,
            ],
        );
        Ok(())
    }
}

/// 元数据先下线、CDC打标之后才删除物理表，删除物理表不可回滚
pub struct DropTableTemplate;

impl JobTemplate for DropTableTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::DropTable
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, true)?,
                acquire_mdl(request)?,
                update_meta(request, MetaAction::Unregister)?,
                cdc_mark(request, BTreeMap::new())?,
                spec(
                    DropPhysicalTablesTask::TYPE,
                    &DropPhysicalTablesTask {
                        physical: request.physical(false),
                    },
                    request.remark(),
                )?,
                sync(
                    request,
                    SyncAction::DropTable {
                        schema_name: request.schema_name.clone(),
                        table_name: request.table_name.clone(),
                    },
                )?,
            ],
        );
        Ok(())
    }
}

/// 元数据改名和CDC打标在同一个事务中提交，下游不会看到只改了一半的状态
pub struct RenameTableTemplate;

impl JobTemplate for RenameTableTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::RenameTable
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        let new_name = request.require_new_table_name()?.to_string();

        let mut specs = vec![
            validate(&request.table_name, true)?,
            validate(&new_name, false)?,
            acquire_mdl(request)?,
        ];
        if !request.physical_statements.is_empty() {
            specs.push(spec(
                AlterPhysicalTablesTask::TYPE,
                &AlterPhysicalTablesTask {
                    physical: request.physical(true),
                },
                request.remark(),
            )?);
        }
        let prefix = builder.add_sequence(None, specs);

        let mut extra_params = BTreeMap::new();
        extra_params.insert(TABLE_NEW_NAME.to_string(), serde_json::json!(new_name));
        let pattern = request
            .new_table_pattern
            .as_deref()
            .filter(|pattern| !pattern.trim().is_empty())
            .unwrap_or(&new_name);
        extra_params.insert(TABLE_NEW_PATTERN.to_string(), serde_json::json!(pattern));
        let grouped = builder.add_sequence(
            prefix.last().copied(),
            vec![
                update_meta(
                    request,
                    MetaAction::Rename {
                        new_name: new_name.clone(),
                    },
                )?,
                cdc_mark(request, extra_params)?,
            ],
        );
        builder.set_transaction_group(&grouped, "rename_meta_and_cdc");

        builder.add_sequence(
            grouped.last().copied(),
            vec![sync(request, invalidate(request, &request.table_name))?],
        );
        Ok(())
    }
}

/// 清空数据无法恢复，物理变更不带回滚语句
pub struct TruncateTableTemplate;

impl JobTemplate for TruncateTableTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::TruncateTable
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, true)?,
                acquire_mdl(request)?,
                spec(
                    AlterPhysicalTablesTask::TYPE,
                    &AlterPhysicalTablesTask {
                        physical: request.physical(false),
                    },
                    request.remark(),
                )?,
                update_meta(request, MetaAction::BumpVersion)?,
                cdc_mark(request, BTreeMap::new())?,
                sync(request, reload(request))?,
            ],
        );
        Ok(())
    }
}

pub struct CreateIndexTemplate;

impl JobTemplate for CreateIndexTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::CreateIndex
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        let index_name = request.require_index_name()?;
        let prefix = builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, true)?,
                acquire_mdl(request)?,
                spec(
                    CreatePhysicalTablesTask::TYPE,
                    &CreatePhysicalTablesTask {
                        physical: request.physical(true),
                    },
                    format!("{} |indexName: {}", request.remark(), index_name),
                )?,
            ],
        );
        let grouped = builder.add_sequence(
            prefix.last().copied(),
            vec![
                update_meta(request, MetaAction::BumpVersion)?,
                cdc_mark(request, BTreeMap::new())?,
            ],
        );
        builder.set_transaction_group(&grouped, "index_meta_and_cdc");
        builder.add_sequence(grouped.last().copied(), vec![sync(request, reload(request))?]);
        Ok(())
    }
}

pub struct DropIndexTemplate;

impl JobTemplate for DropIndexTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::DropIndex
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        let index_name = request.require_index_name()?;
        builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, true)?,
                acquire_mdl(request)?,
                update_meta(request, MetaAction::BumpVersion)?,
                cdc_mark(request, BTreeMap::new())?,
                spec(
                    DropPhysicalTablesTask::TYPE,
                    &DropPhysicalTablesTask {
                        physical: request.physical(false),
                    },
                    format!("{} |indexName: {}", request.remark(), index_name),
                )?,
                sync(request, reload(request))?,
            ],
        );
        Ok(())
    }
}

/// 分区变更由同步动作自行完成MDL排空，不在任务开始时持有实例级锁
pub struct RepartitionTemplate;

impl JobTemplate for RepartitionTemplate {
    fn ddl_type(&self) -> DdlType {
        DdlType::Repartition
    }

    fn build(&self, builder: &mut JobBuilder, request: &DdlRequest) -> DdlResult<()> {
        let trace_id = request.trace_id.clone().unwrap_or_default();
        builder.add_sequence(
            None,
            vec![
                validate(&request.table_name, true)?,
                spec(
                    CreatePhysicalTablesTask::TYPE,
                    &CreatePhysicalTablesTask {
                        physical: request.physical(true),
                    },
                    request.remark(),
                )?,
                update_meta(request, MetaAction::BumpVersion)?,
                cdc_mark(request, BTreeMap::new())?,
                sync(
                    request,
                    SyncAction::Repartition {
                        schema_name: request.schema_name.clone(),
                        primary_table: request.table_name.clone(),
                        gsi_table: request.gsi_table.clone(),
                        trace_id,
                    },
                )?,
            ],
        );
        Ok(())
    }
}

/// DDL类型到模板的策略表
#[derive(Clone)]
pub struct DdlJobFactory {
    templates: HashMap<DdlType, Arc<dyn JobTemplate>>,
}

impl Default for DdlJobFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DdlJobFactory {
    pub fn new() -> Self {
        let mut factory = Self {
            templates: HashMap::new(),
        };
        factory.register(Arc::new(CreateTableTemplate));
        factory.register(Arc::new(AlterTableTemplate));
        factory.register(Arc::new(DropTableTemplate));
        factory.register(Arc::new(RenameTableTemplate));
        factory.register(Arc::new(TruncateTableTemplate));
        factory.register(Arc::new(CreateIndexTemplate));
        factory.register(Arc::new(DropIndexTemplate));
        factory.register(Arc::new(RepartitionTemplate));
        factory
    }

    /// 同一DDL类型的模板会被替换
    pub fn register(&mut self, template: Arc<dyn JobTemplate>) {
        self.templates.insert(template.ddl_type(), template);
    }

    pub fn create_job(&self, ddl_type: DdlType, request: &DdlRequest) -> DdlResult<ExecutableJob> {
        if request.schema_name.trim().is_empty() || request.table_name.trim().is_empty() {
            return Err(DdlError::validation_error("DDL请求缺少库名或表名"));
        }
        let template = self.templates.get(&ddl_type).ok_or_else(|| {
            DdlError::validation_error(format!("不支持的DDL类型: {ddl_type}"))
        })?;

        let mut request = request.clone();
        let trace_id = request
            .trace_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone();

        let mut builder = JobBuilder::new(&request.schema_name, ddl_type, &request.ddl_stmt)
            .with_trace_id(trace_id);
        template.build(&mut builder, &request)?;
        debug!(
            "DDL {} 展开为 {} 个子任务: {}.{}",
            ddl_type,
            builder.task_count(),
            request.schema_name,
            request.table_name
        );
        builder.build()
    }
}
