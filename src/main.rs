use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use ddl_core::logging::init_logging;
use ddl_core::{AppConfig, LogFormat, SchedulerConfig};
use ddl_domain::{DdlType, JobFilter, JobState, PhysicalStatement};
use ddl_dispatcher::DdlRequest;
use ddl_engine::{Application, ShutdownManager};
use tokio::signal;
use tracing::{error, info, warn};

/// DDL引擎命令行
#[derive(clap::Parser, Debug)]
#[command(name = "ddl-engine")]
#[command(version = "1.0.0")]
#[command(about = "分布式DDL任务执行引擎")]
struct Cli {
    /// 配置文件路径，未指定时依次查找 config/ddl_engine.toml 和 ddl_engine.toml
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    /// 节点标识，覆盖配置文件
    #[arg(long)]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动调度器并持续驱动DDL任务（默认）
    Serve,
    /// DDL任务管理
    Job(JobCommands),
}

#[derive(Args, Debug)]
struct JobCommands {
    #[command(subcommand)]
    action: JobActions,
}

#[derive(Subcommand, Debug)]
enum JobActions {
    /// 提交DDL任务并等待结束
    Submit {
        /// DDL类型，例如 CREATE_TABLE
        #[arg(long = "type")]
        ddl_type: String,
        #[arg(long)]
        schema: String,
        #[arg(long)]
        table: String,
        /// 原始DDL语句
        #[arg(long)]
        stmt: String,
        /// 物理语句，格式为 `分片=SQL`，可重复
        #[arg(long = "physical")]
        physical: Vec<String>,
        /// 物理语句的撤销语句，格式同上，可重复
        #[arg(long = "rollback")]
        rollback: Vec<String>,
        #[arg(long)]
        new_table_name: Option<String>,
        /// 改名后物理表的命名模式
        #[arg(long)]
        new_table_pattern: Option<String>,
        #[arg(long)]
        index_name: Option<String>,
        /// 等待任务结束的最长时间（秒）
        #[arg(long, default_value = "60")]
        wait_seconds: u64,
    },
    /// 查看任务详情
    Status { job_id: i64 },
    /// 列出任务
    List {
        /// 状态过滤，例如 RUNNING
        #[arg(short, long)]
        state: Option<String>,
        #[arg(long)]
        schema: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// 请求取消任务
    Cancel { job_id: i64 },
    /// 清理早于给定时间的已结束任务
    Purge {
        #[arg(long, default_value = "24")]
        older_than_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <Cli as clap::Parser>::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    config.scheduler.node_id = resolve_node_id(cli.node_id, &config.scheduler);

    init_logging(&config.logging)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Job(job_cmd) => handle_job_commands(job_cmd, config).await,
    }
}

/// 命令行优先；配置文件仍是内置默认值时使用主机名，避免多个节点共用同一个标识
fn resolve_node_id(cli_node_id: Option<String>, config: &SchedulerConfig) -> String {
    if let Some(node_id) = cli_node_id {
        return node_id;
    }
    if config.node_id != SchedulerConfig::default().node_id {
        return config.node_id.clone();
    }
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| config.node_id.clone())
}

async fn serve(config: AppConfig) -> Result<()> {
    info!(node_id = %config.scheduler.node_id, "启动分布式DDL任务执行引擎");

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new(Duration::from_secs(30));

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("引擎运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    let drained = shutdown_manager
        .graceful_shutdown(async {
            if let Err(e) = app_handle.await {
                error!("引擎关闭时发生错误: {e}");
            }
        })
        .await;
    if !drained {
        warn!("强制退出");
    }

    info!("分布式DDL任务执行引擎已退出");
    Ok(())
}

async fn handle_job_commands(job_cmd: JobCommands, config: AppConfig) -> Result<()> {
    let app = Application::new(config).await?;
    let scheduler = app.scheduler();

    match job_cmd.action {
        JobActions::Submit {
            ddl_type,
            schema,
            table,
            stmt,
            physical,
            rollback,
            new_table_name,
            new_table_pattern,
            index_name,
            wait_seconds,
        } => {
            let ddl_type: DdlType = ddl_type.parse()?;
            let mut request = DdlRequest::new(schema, table, stmt)
                .with_physical(parse_statements(&physical)?, parse_statements(&rollback)?);
            if let Some(name) = new_table_name {
                request = request.with_new_table_name(name);
            }
            if let Some(pattern) = new_table_pattern {
                request = request.with_new_table_pattern(pattern);
            }
            if let Some(name) = index_name {
                request = request.with_index_name(name);
            }

            let job = app.job_factory().create_job(ddl_type, &request)?;
            let job_id = scheduler.submit(job).await?;
            println!("任务已提交: {job_id}");

            let job = scheduler
                .await_terminal(job_id, Duration::from_secs(wait_seconds))
                .await
                .with_context(|| format!("等待任务 {job_id} 结束失败"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobActions::Status { job_id } => {
            let job = scheduler.job_status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobActions::List {
            state,
            schema,
            limit,
        } => {
            let filter = JobFilter {
                state: state.as_deref().map(str::parse::<JobState>).transpose()?,
                schema_name: schema,
                ddl_type: None,
                limit: Some(limit),
            };
            for job in scheduler.list_jobs(&filter).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    job.job_id, job.state, job.ddl_type, job.schema_name, job.ddl_stmt
                );
            }
        }
        JobActions::Cancel { job_id } => {
            if scheduler.cancel(job_id).await? {
                println!("已请求取消任务 {job_id}");
            } else {
                println!("任务 {job_id} 已结束，无法取消");
            }
        }
        JobActions::Purge { older_than_hours } => {
            let before = chrono::Utc::now() - chrono::Duration::hours(older_than_hours);
            let purged = scheduler.purge(before).await?;
            println!("已清理 {purged} 个已结束的任务");
        }
    }

    // 取消排队中的任务会立即开始回滚
    scheduler.shutdown().await;
    Ok(())
}

/// 解析 `分片=SQL` 形式的物理语句
fn parse_statements(specs: &[String]) -> Result<Vec<PhysicalStatement>> {
    specs
        .iter()
        .map(|spec| {
            let (shard, sql) = spec
                .split_once('=')
                .with_context(|| format!("物理语句格式应为 分片=SQL: {spec}"))?;
            Ok(PhysicalStatement::new(shard.trim(), sql.trim()))
        })
        .collect()
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
