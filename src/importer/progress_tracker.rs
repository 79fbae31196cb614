// ==========================================
// 供应商目录导入系统 - 任务进度跟踪
// ==========================================
// 职责: 任务状态 / 单调进度 / 分块失败汇总 / 一次性终结
// 红线: 进度只增不减；终结写入只发生一次
// ==========================================

use crate::config::TrackerConfig;
use crate::domain::job::{FailedChunkDetail, JobResults, JobUpdate};
use crate::domain::types::JobStatus;
use crate::importer::error::{ImportError, ImportResult};
use crate::repository::job_store::JobStateStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// 终结结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::CompletedWithErrors => JobStatus::CompletedWithErrors,
            JobOutcome::Failed => JobStatus::Failed,
        }
    }
}

// ==========================================
// ProgressTracker
// ==========================================
pub struct ProgressTracker {
    store: Arc<dyn JobStateStore>,
    job_id: String,
    config: TrackerConfig,
    last_progress: u8,
    failure_count: u64,
    failure_details: Vec<FailedChunkDetail>,
    finalized: bool,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn JobStateStore>, job_id: impl Into<String>, config: TrackerConfig) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            config,
            last_progress: 0,
            failure_count: 0,
            failure_details: Vec::new(),
            finalized: false,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn last_progress(&self) -> u8 {
        self.last_progress
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    /// pending → processing，进度置 1
    pub async fn start(&mut self) -> ImportResult<()> {
        let now = Utc::now();
        self.store
            .update(
                &self.job_id,
                JobUpdate::default()
                    .status(JobStatus::Processing)
                    .progress(1)
                    .message("处理中")
                    .started_at(now),
            )
            .await?;
        self.last_progress = self.last_progress.max(1);
        info!(job_id = %self.job_id, "任务开始处理");
        Ok(())
    }

    /// 推进进度（取 max(上次写入, 已存储, 新值)，永不回退）
    ///
    /// # 返回
    /// - Ok(u8): 实际写入的进度
    pub async fn advance(
        &mut self,
        progress: u8,
        message: Option<String>,
        total_rows_estimate: Option<u64>,
    ) -> ImportResult<u8> {
        if self.finalized {
            return Err(ImportError::AlreadyFinalized(self.job_id.clone()));
        }

        let stored = self
            .store
            .get_by_id(&self.job_id)
            .await?
            .map(|job| job.progress)
            .unwrap_or(0);
        // 100 只由终结写入
        let next = progress.min(99).max(self.last_progress).max(stored.min(99));

        let mut update = JobUpdate::default().progress(next);
        if let Some(message) = message {
            update = update.message(message);
        }
        if let Some(estimate) = total_rows_estimate {
            update = update.total_rows_estimate(estimate);
        }
        self.store.update(&self.job_id, update).await?;
        self.last_progress = next;
        debug!(job_id = %self.job_id, progress = next, "进度已推进");
        Ok(next)
    }

    /// 记录分块失败（明细有上限，计数不设限）
    pub fn record_chunk_failure(&mut self, detail: FailedChunkDetail) {
        self.failure_count += 1;
        if self.failure_details.len() < self.config.max_failed_chunk_details {
            self.failure_details.push(detail);
        }
    }

    /// 单次终结写入
    ///
    /// # 返回
    /// - Err(AlreadyFinalized): 重复终结
    pub async fn finalize(
        &mut self,
        outcome: JobOutcome,
        mut results: JobResults,
        message: impl Into<String>,
    ) -> ImportResult<()> {
        if self.finalized {
            return Err(ImportError::AlreadyFinalized(self.job_id.clone()));
        }
        self.finalized = true;

        results.failed_chunk_count = self.failure_count;
        results.failed_chunk_details = std::mem::take(&mut self.failure_details);
        let message = message.into();

        self.store
            .update(
                &self.job_id,
                JobUpdate::default()
                    .status(outcome.status())
                    .progress(100)
                    .message(message.clone())
                    .results(results)
                    .completed_at(Utc::now()),
            )
            .await?;
        self.last_progress = 100;

        info!(
            job_id = %self.job_id,
            status = %outcome.status(),
            failed_chunks = self.failure_count,
            message = %message,
            "任务已终结"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_schema, open_sqlite_connection};
    use crate::domain::job::ImportJob;
    use crate::domain::types::JobKind;
    use crate::repository::job_store_impl::SqliteJobStateStore;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    async fn tracker(details: usize) -> (NamedTempFile, Arc<SqliteJobStateStore>, ProgressTracker) {
        let file = NamedTempFile::new().unwrap();
        let conn = open_sqlite_connection(file.path().to_str().unwrap()).unwrap();
        init_schema(&conn).unwrap();
        let store = Arc::new(SqliteJobStateStore::from_connection(Arc::new(Mutex::new(conn))));
        let job = ImportJob::new_pending(JobKind::Supplier, "/tmp/a.csv");
        store.create(&job).await.unwrap();
        let tracker = ProgressTracker::new(
            store.clone(),
            job.id.clone(),
            TrackerConfig {
                max_failed_chunk_details: details,
            },
        );
        (file, store, tracker)
    }

    fn detail(index: u64) -> FailedChunkDetail {
        FailedChunkDetail {
            chunk_index: index,
            first_row: 1,
            last_row: 2,
            rows_affected: 2,
            stage: "matched_links".to_string(),
            error: "boom".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (_file, store, mut tracker) = tracker(10).await;
        tracker.start().await.unwrap();

        let mut observed = Vec::new();
        for p in [10u8, 40, 20, 5, 60, 100] {
            observed.push(tracker.advance(p, None, None).await.unwrap());
        }
        assert_eq!(observed, vec![10, 40, 40, 40, 60, 99]);

        let job = store.get_by_id(tracker.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 99);
    }

    #[tokio::test]
    async fn test_finalize_once_with_bounded_details() {
        let (_file, store, mut tracker) = tracker(2).await;
        tracker.start().await.unwrap();
        for i in 0..5 {
            tracker.record_chunk_failure(detail(i));
        }

        tracker
            .finalize(JobOutcome::CompletedWithErrors, JobResults::default(), "完成（有错误）")
            .await
            .unwrap();
        let err = tracker
            .finalize(JobOutcome::Completed, JobResults::default(), "again")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::AlreadyFinalized(_)));

        let job = store.get_by_id(tracker.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert_eq!(job.progress, 100);
        let results = job.results.unwrap();
        assert_eq!(results.failed_chunk_count, 5);
        assert_eq!(results.failed_chunk_details.len(), 2);
    }
}
