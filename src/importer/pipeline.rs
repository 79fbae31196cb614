// ==========================================
// 供应商目录导入系统 - 导入流水线
// ==========================================
// 职责: 串联单个任务的完整流程
// 流程: 打开文件 → 表头映射 → 必填校验 → 拉取目录(供应商)
//       → 逐块 投影 → 匹配 → 落库 → 推进进度 → 节流 → 终结
// 红线: 分块严格串行；致命错误 failed，分块失败 completed_with_errors
// ==========================================

use crate::config::ImportConfig;
use crate::domain::catalog::ProductRecord;
use crate::domain::job::{FailedChunkDetail, ImportJob, JobResults, JobUpdate};
use crate::domain::supplier::{SupplierGroup, SupplierLineItem};
use crate::domain::types::{JobKind, JobStatus, MatchStrategy};
use crate::importer::batch_writer::{BatchWriter, ChunkWriteReport};
use crate::importer::chunk_stream::{estimate_total_rows, progress_for_bytes, Chunk, ChunkStream};
use crate::importer::column_mapper::{find_header, ColumnMapper, FieldDictionary};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::identity_resolver::{
    load_candidate_index, CandidateIndex, IdentityResolver, MpnBackfill,
};
use crate::importer::memory_governor::{MemoryGovernor, MemorySampler, SysinfoSampler};
use crate::importer::progress_tracker::{JobOutcome, ProgressTracker};
use crate::importer::row_projector::{CandidateRecord, Projected, RowProjector};
use crate::repository::job_store::JobStateStore;
use crate::repository::record_store::{Filter, RecordStore, Row, Table};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

// ==========================================
// ImportPipeline
// ==========================================
pub struct ImportPipeline {
    job_store: Arc<dyn JobStateStore>,
    record_store: Arc<dyn RecordStore>,
    config: ImportConfig,
    sampler: Arc<dyn MemorySampler>,
}

impl ImportPipeline {
    /// 创建流水线
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
        Self {
            job_store,
            record_store,
            config,
            sampler: Arc::new(SysinfoSampler::new()),
        }
    }

    /// 替换内存采样器
    pub fn with_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// 执行一个任务直至终结
    ///
    /// # 返回
    /// - Ok(JobStatus): 终态
    /// - Err: 任务无法启动或终结写入失败
    #[instrument(skip(self))]
    pub async fn run(&self, job_id: &str) -> ImportResult<JobStatus> {
        let job = self
            .job_store
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| ImportError::JobStateError(format!("任务不存在: {}", job_id)))?;

        let mut tracker = ProgressTracker::new(
            Arc::clone(&self.job_store),
            job.id.clone(),
            self.config.tracker.clone(),
        );
        if let Err(e) = tracker.start().await {
            error!(error = %e, "任务启动写入失败");
            self.mark_failed(&job.id, &e).await;
            return Err(e);
        }

        info!(
            kind = %job.kind,
            file = %job.file_name,
            batch_size = self.config.persistence.effective_batch_size(job.batch_size),
            "开始导入"
        );

        let mut results = JobResults::default();
        let (outcome, message) = match self.process(&job, &mut tracker, &mut results).await {
            Ok(()) if tracker.failure_count() > 0 => (
                JobOutcome::CompletedWithErrors,
                format!("导入完成，{} 个批次写入失败", tracker.failure_count()),
            ),
            Ok(()) => (JobOutcome::Completed, "导入完成".to_string()),
            Err(e) => {
                error!(error = %e, "导入失败");
                (JobOutcome::Failed, e.to_string())
            }
        };

        info!(
            total = results.total_records,
            successful = results.successful_imports,
            failed = results.failed_imports,
            matched = results.match_stats.total_matched,
            unmatched = results.match_stats.unmatched_count,
            reconciled = results.is_reconciled(),
            "导入统计"
        );

        if let Err(e) = tracker.finalize(outcome, results, message).await {
            error!(error = %e, "任务终结写入失败");
            self.mark_failed(&job.id, &e).await;
            return Err(e);
        }
        Ok(outcome.status())
    }

    /// 尽力把任务置为 failed，失败只记日志
    ///
    /// pending 任务先经 processing 再到 failed；已是终态则不动
    async fn mark_failed(&self, job_id: &str, cause: &ImportError) {
        let status = match self.job_store.get_by_id(job_id).await {
            Ok(Some(job)) => job.status,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "读取任务状态失败，无法标记 failed");
                return;
            }
        };
        if status.is_terminal() {
            return;
        }

        let now = Utc::now();
        if status == JobStatus::Pending {
            let update = JobUpdate::default()
                .status(JobStatus::Processing)
                .started_at(now);
            if let Err(e) = self.job_store.update(job_id, update).await {
                error!(job_id = %job_id, error = %e, "标记 failed 失败");
                return;
            }
        }

        let update = JobUpdate::default()
            .status(JobStatus::Failed)
            .progress(100)
            .message(cause.to_string())
            .completed_at(now);
        match self.job_store.update(job_id, update).await {
            Ok(()) => warn!(job_id = %job_id, "任务已标记 failed"),
            Err(e) => error!(job_id = %job_id, error = %e, "标记 failed 失败"),
        }
    }

    async fn process(
        &self,
        job: &ImportJob,
        tracker: &mut ProgressTracker,
        results: &mut JobResults,
    ) -> ImportResult<()> {
        let mut stream = ChunkStream::open(&job.source_file_path, &self.config.stream).await?;

        // ===== 表头映射 =====
        let dictionary = FieldDictionary::for_kind(job.kind)
            .with_custom_attributes(job.custom_attributes.iter().map(String::as_str));
        let mapping = ColumnMapper::resolve(stream.headers(), &dictionary, &job.field_mapping);
        let missing = mapping.missing_required(&dictionary);
        if !missing.is_empty() {
            stream.close().await?;
            return Err(ImportError::MissingFieldMapping { fields: missing });
        }

        let override_columns = resolve_override_columns(stream.headers(), &job.match_column_overrides);
        let projector = RowProjector::new(dictionary, mapping, override_columns, job.created_at);

        // ===== 目录索引（供应商任务）=====
        let index = match job.kind {
            JobKind::Supplier => match load_candidate_index(self.record_store.as_ref()).await {
                Ok(index) => index,
                Err(e) => {
                    stream.close().await?;
                    return Err(e);
                }
            },
            JobKind::Product => CandidateIndex::default(),
        };

        let mut governor = MemoryGovernor::new(self.config.governor.clone(), Arc::clone(&self.sampler));
        governor.start();

        let mut run = JobRun {
            kind: job.kind,
            projector,
            index,
            resolver: IdentityResolver::new(&job.match_options),
            writer: BatchWriter::new(
                Arc::clone(&self.record_store),
                self.config.persistence.effective_batch_size(job.batch_size),
            ),
            record_store: Arc::clone(&self.record_store),
            buffers: RowBuffers::with_capacity(self.config.stream.chunk_size),
            backfills: Vec::new(),
            rows_seen: 0,
        };

        let file_len = stream.file_len();
        let stream_result = async {
            while let Some(chunk) = stream.next_chunk().await? {
                let report = run.process_chunk(&chunk, results).await;

                if report.has_failures() {
                    for failure in &report.failures {
                        tracker.record_chunk_failure(FailedChunkDetail {
                            chunk_index: chunk.index,
                            first_row: chunk.first_row,
                            last_row: chunk.last_row,
                            rows_affected: failure.rows,
                            stage: failure.stage.to_string(),
                            error: failure.message.clone(),
                            occurred_at: Utc::now(),
                        });
                    }
                    governor.record_failure();
                } else {
                    governor.record_success();
                }

                run.rows_seen += chunk.rows_consumed();
                let progress = progress_for_bytes(chunk.bytes_read, file_len);
                let estimate = estimate_total_rows(run.rows_seen, chunk.bytes_read, file_len);
                if let Err(e) = tracker
                    .advance(progress, Some(format!("已处理 {} 行", run.rows_seen)), estimate)
                    .await
                {
                    warn!(error = %e, "进度写入失败");
                }

                // ===== 节流与回收 =====
                let delay = governor.throttle_delay();
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "分块间节流");
                    tokio::time::sleep(delay).await;
                }
                if governor.take_collect_hint() {
                    run.buffers.release();
                    debug!(resident = governor.last_sample_bytes(), "已释放行缓冲");
                }
            }
            Ok::<(), ImportError>(())
        }
        .await;

        governor.stop();
        run.drain_backfills().await;
        if let Err(e) = stream.close().await {
            warn!(error = %e, "解析线程退出异常");
        }

        stream_result
    }
}

/// 匹配列覆盖：策略 → 列序号（表头不存在时忽略）
fn resolve_override_columns(
    headers: &[String],
    overrides: &BTreeMap<MatchStrategy, String>,
) -> BTreeMap<MatchStrategy, usize> {
    overrides
        .iter()
        .filter_map(|(strategy, header)| match find_header(headers, header) {
            Some(idx) => Some((*strategy, idx)),
            None => {
                warn!(strategy = %strategy, header = %header, "匹配列覆盖的表头不存在，已忽略");
                None
            }
        })
        .collect()
}

/// 分块间复用的行缓冲
struct RowBuffers {
    items: Vec<SupplierLineItem>,
    products: Vec<ProductRecord>,
}

impl RowBuffers {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            products: Vec::new(),
        }
    }

    fn release(&mut self) {
        self.items.clear();
        self.items.shrink_to_fit();
        self.products.clear();
        self.products.shrink_to_fit();
    }
}

/// 单个任务运行期状态
struct JobRun {
    kind: JobKind,
    projector: RowProjector,
    index: CandidateIndex,
    resolver: IdentityResolver,
    writer: BatchWriter,
    record_store: Arc<dyn RecordStore>,
    buffers: RowBuffers,
    backfills: Vec<JoinHandle<()>>,
    rows_seen: u64,
}

impl JobRun {
    #[instrument(skip_all, fields(chunk_index = chunk.index, rows = chunk.rows.len()))]
    async fn process_chunk(&mut self, chunk: &Chunk, results: &mut JobResults) -> ChunkWriteReport {
        results.total_records += chunk.rows_consumed();
        results.malformed_rows += chunk.malformed;
        results.failed_imports += chunk.malformed;

        for row in &chunk.rows {
            match self.projector.project(row) {
                Projected::Record(CandidateRecord::Supplier(item)) => self.buffers.items.push(item),
                Projected::Record(CandidateRecord::Product(record)) => {
                    self.buffers.products.push(record)
                }
                Projected::Skip(reason) => {
                    debug!(row = row.row_number, reason = %reason, "行已跳过");
                    results.skipped_rows += 1;
                    results.failed_imports += 1;
                }
            }
        }

        let report = match self.kind {
            JobKind::Supplier => {
                let groups = SupplierGroup::group_items(self.buffers.items.drain(..).collect());
                let outcome = self.resolver.resolve(&self.index, groups);
                results.match_stats.merge(&outcome.stats);
                for backfill in outcome.backfills {
                    self.spawn_backfill(backfill);
                }
                self.writer.write_supplier_chunk(&outcome.groups).await
            }
            JobKind::Product => {
                let records: Vec<ProductRecord> = self.buffers.products.drain(..).collect();
                self.writer.write_product_chunk(records).await
            }
        };

        results.successful_imports += report.successful;
        results.failed_imports += report.failed;
        results.duplicate_rows += report.duplicate_rows;
        results.suppliers_added += report.suppliers_added;
        results.products_upserted += report.products_upserted;

        debug!(
            successful = report.successful,
            failed = report.failed,
            batch_failures = report.failures.len(),
            "分块处理完成"
        );
        report
    }

    /// 异步回填目录 MPN（失败只记日志）
    fn spawn_backfill(&mut self, backfill: MpnBackfill) {
        let store = Arc::clone(&self.record_store);
        self.backfills.push(tokio::spawn(async move {
            let mut fields = Row::new();
            fields.insert("mpn".to_string(), Value::from(backfill.mpn.clone()));
            fields.insert("updated_at".to_string(), Value::from(Utc::now().to_rfc3339()));
            match store
                .update(Table::Products, Filter::eq("id", backfill.product_id), fields)
                .await
            {
                Ok(_) => debug!(product_id = backfill.product_id, mpn = %backfill.mpn, "MPN 已回填"),
                Err(e) => warn!(product_id = backfill.product_id, error = %e, "MPN 回填失败"),
            }
        }));
    }

    /// 等待全部回填结束
    async fn drain_backfills(&mut self) {
        if self.backfills.is_empty() {
            return;
        }
        let count = self.backfills.len();
        for joined in join_all(self.backfills.drain(..)).await {
            if let Err(e) = joined {
                warn!(error = %e, "MPN 回填任务异常退出");
            }
        }
        debug!(count, "MPN 回填已全部结束");
    }
}
