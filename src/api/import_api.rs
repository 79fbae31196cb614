// ==========================================
// 供应商目录导入系统 - 导入 API
// ==========================================
// 职责: 任务提交 / 状态查询 / 并发任务数控制
// 并发: tokio Semaphore 限制同时运行的任务，排队任务保持 pending
// 查询: 超时返回"仍在处理中"占位视图，状态接口不挂起
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::{ConfigManager, ImportConfig, ImportConfigReader};
use crate::db::{init_schema, open_sqlite_connection};
use crate::domain::job::{ImportJob, JobStatusView, MatchOptions};
use crate::domain::types::{JobKind, JobStatus, MatchStrategy};
use crate::importer::memory_governor::MemorySampler;
use crate::importer::pipeline::ImportPipeline;
use crate::perf::install_sqlite_tracing;
use crate::repository::job_store::JobStateStore;
use crate::repository::job_store_impl::SqliteJobStateStore;
use crate::repository::record_store::RecordStore;
use crate::repository::record_store_impl::SqliteRecordStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// 超时占位视图的消息
pub const STILL_PROCESSING_MESSAGE: &str = "仍在处理中";

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: JobKind,
    #[serde(alias = "filePath")]
    pub file_path: String,
    #[serde(default, alias = "fieldMapping")]
    pub field_mapping: BTreeMap<String, String>,
    #[serde(default, alias = "matchOptions")]
    pub match_options: MatchOptions,
    #[serde(default, alias = "matchColumnOverrides")]
    pub match_column_overrides: BTreeMap<MatchStrategy, String>,
    #[serde(default, alias = "customAttributes")]
    pub custom_attributes: Vec<String>,
    #[serde(default, alias = "batchSize")]
    pub batch_size: Option<usize>,
}

impl SubmitJobRequest {
    pub fn new(kind: JobKind, file_path: impl Into<String>) -> Self {
        Self {
            kind,
            file_path: file_path.into(),
            field_mapping: BTreeMap::new(),
            match_options: MatchOptions::default(),
            match_column_overrides: BTreeMap::new(),
            custom_attributes: Vec::new(),
            batch_size: None,
        }
    }

    fn into_job(self) -> ImportJob {
        let mut job = ImportJob::new_pending(self.kind, self.file_path);
        job.field_mapping = self.field_mapping;
        job.match_options = self.match_options;
        job.match_column_overrides = self.match_column_overrides;
        job.custom_attributes = self.custom_attributes;
        job.batch_size = self.batch_size;
        job
    }
}

/// 导入API
pub struct ImportApi {
    job_store: Arc<dyn JobStateStore>,
    pipeline: Arc<ImportPipeline>,
    permits: Arc<Semaphore>,
    config: ImportConfig,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ImportApi {
    /// 创建新的 ImportApi 实例
    ///
    /// # 参数
    /// - job_store: 任务状态存储
    /// - record_store: 记录存储
    /// - config: 导入配置
    pub fn new(
        job_store: Arc<dyn JobStateStore>,
        record_store: Arc<dyn RecordStore>,
        config: ImportConfig,
    ) -> Self {
        let pipeline = ImportPipeline::new(Arc::clone(&job_store), record_store, config.clone());
        Self::from_pipeline(job_store, pipeline)
    }

    /// 使用注入的内存采样器创建
    pub fn with_sampler(
        job_store: Arc<dyn JobStateStore>,
        record_store: Arc<dyn RecordStore>,
        config: ImportConfig,
        sampler: Arc<dyn MemorySampler>,
    ) -> Self {
        let pipeline = ImportPipeline::new(Arc::clone(&job_store), record_store, config)
            .with_sampler(sampler);
        Self::from_pipeline(job_store, pipeline)
    }

    fn from_pipeline(job_store: Arc<dyn JobStateStore>, pipeline: ImportPipeline) -> Self {
        let config = pipeline.config().clone();
        let permits = config.concurrency.max_concurrent_jobs.max(1);
        Self {
            job_store,
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(permits)),
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// 打开数据库（建表 + 读取 config_kv 覆写）
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub async fn open(db_path: &str) -> ApiResult<Self> {
        let mut conn = open_sqlite_connection(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(e.to_string()))?;
        init_schema(&conn)?;
        install_sqlite_tracing(&mut conn);
        let conn = Arc::new(Mutex::new(conn));

        let config_manager = ConfigManager::from_connection(Arc::clone(&conn))
            .map_err(|e| ApiError::ConfigError(e.to_string()))?;
        let config = config_manager
            .load_import_config()
            .await
            .map_err(|e| ApiError::ConfigError(e.to_string()))?;

        let job_store: Arc<dyn JobStateStore> =
            Arc::new(SqliteJobStateStore::from_connection(Arc::clone(&conn)));
        let record_store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::from_connection(conn));

        info!(db_path, max_concurrent_jobs = config.concurrency.max_concurrent_jobs, "导入服务已就绪");
        Ok(Self::new(job_store, record_store, config))
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// 提交导入任务
    ///
    /// # 返回
    /// - Ok(String): 任务 ID（任务已创建为 pending，后台开始处理）
    /// - Err(ApiError): 请求无效或任务创建失败
    pub async fn submit_job(&self, request: SubmitJobRequest) -> ApiResult<String> {
        if request.file_path.trim().is_empty() {
            return Err(ApiError::InvalidInput("文件路径不能为空".to_string()));
        }
        if request.batch_size == Some(0) {
            return Err(ApiError::InvalidInput("batch_size 必须大于 0".to_string()));
        }

        let job = request.into_job();
        self.job_store.create(&job).await?;
        let job_id = job.id.clone();
        info!(job_id = %job_id, kind = %job.kind, file = %job.file_name, "导入任务已提交");

        let permits = Arc::clone(&self.permits);
        let pipeline = Arc::clone(&self.pipeline);
        let task_job_id = job_id.clone();
        let span = info_span!("import_job", job_id = %job_id);

        let handle = tokio::spawn(
            async move {
                // 排队期间任务保持 pending
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(error = %e, "并发许可获取失败");
                        return;
                    }
                };
                match pipeline.run(&task_job_id).await {
                    Ok(status) => info!(status = %status, "导入任务结束"),
                    Err(e) => error!(error = %e, "导入任务异常结束"),
                }
            }
            .instrument(span),
        );

        let mut running = self
            .running
            .lock()
            .map_err(|e| ApiError::InternalError(format!("锁获取失败: {}", e)))?;
        running.retain(|_, h| !h.is_finished());
        running.insert(job_id.clone(), handle);

        Ok(job_id)
    }

    /// 查询任务状态
    ///
    /// # 返回
    /// - Ok(JobStatusView): 当前状态；查询超时返回 synthetic = true 的占位视图
    /// - Err(NotFound): 任务不存在
    pub async fn get_job_status(&self, job_id: &str) -> ApiResult<JobStatusView> {
        let timeout = Duration::from_millis(self.config.concurrency.status_query_timeout_ms);

        match tokio::time::timeout(timeout, self.job_store.get_by_id(job_id)).await {
            Err(_) => {
                warn!(job_id, timeout_ms = timeout.as_millis() as u64, "状态查询超时，返回占位视图");
                Ok(Self::still_processing(job_id))
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(None)) => Err(ApiError::NotFound(format!("导入任务(id={})不存在", job_id))),
            Ok(Ok(Some(job))) => Ok(self.view_of(job)),
        }
    }

    fn still_processing(job_id: &str) -> JobStatusView {
        JobStatusView {
            job_id: job_id.to_string(),
            status: JobStatus::Processing,
            progress: 0,
            message: Some(STILL_PROCESSING_MESSAGE.to_string()),
            total_rows_estimate: None,
            results: None,
            synthetic: true,
        }
    }

    fn view_of(&self, job: ImportJob) -> JobStatusView {
        let results = if job.status.is_terminal() {
            job.results
                .as_ref()
                .map(|r| r.summarized(self.config.concurrency.status_detail_limit))
        } else {
            None
        };

        JobStatusView {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            message: job.status_message,
            total_rows_estimate: job.total_rows_estimate,
            results,
            synthetic: false,
        }
    }

    /// 等待任务的后台处理结束
    pub async fn wait_for_job(&self, job_id: &str) -> ApiResult<()> {
        let handle = self
            .running
            .lock()
            .map_err(|e| ApiError::InternalError(format!("锁获取失败: {}", e)))?
            .remove(job_id);

        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| ApiError::InternalError(format!("后台任务异常退出: {}", e)))?;
        }
        Ok(())
    }

    /// 等待全部后台任务结束
    pub async fn shutdown(&self) -> ApiResult<()> {
        let handles: Vec<JoinHandle<()>> = self
            .running
            .lock()
            .map_err(|e| ApiError::InternalError(format!("锁获取失败: {}", e)))?
            .drain()
            .map(|(_, h)| h)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "后台任务异常退出");
            }
        }
        Ok(())
    }
}
