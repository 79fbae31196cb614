// ==========================================
// 导入 API 行为测试
// ==========================================
// 覆盖: 致命错误 failed / 并发上限排队 / 状态查询超时占位 / 进度单调 / 未知任务
// ==========================================

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use supplier_catalog_import::api::STILL_PROCESSING_MESSAGE;
use supplier_catalog_import::domain::{ImportJob, JobUpdate};
use supplier_catalog_import::repository::{
    Filter, JobStateStore, RecordStore, RepositoryError, RepositoryResult, Row,
    SqliteJobStateStore, SqliteRecordStore, Table,
};
use supplier_catalog_import::{ApiError, ImportApi, JobKind, JobStatus, SubmitJobRequest};
use tokio::sync::Semaphore;

use test_helpers::{
    count_rows, create_test_db, open_stores, small_chunk_config, write_csv, FixedSampler,
};

async fn wait_terminal(api: &ImportApi, job_id: &str) -> JobStatus {
    api.wait_for_job(job_id).await.unwrap();
    api.get_job_status(job_id).await.unwrap().status
}

// ==========================================
// 致命错误
// ==========================================

#[tokio::test]
async fn test_missing_file_fails_job() {
    let (_db, db_path) = create_test_db().unwrap();
    let (job_store, record_store) = open_stores(&db_path);
    let api = ImportApi::new(job_store, record_store, small_chunk_config(10));

    let job_id = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, "/nonexistent/quotes.csv"))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&api, &job_id).await, JobStatus::Failed);

    let view = api.get_job_status(&job_id).await.unwrap();
    assert_eq!(view.progress, 100);
    assert!(view.message.is_some());
    let results = view.results.unwrap();
    assert_eq!(results.total_records, 0);
}

#[tokio::test]
async fn test_missing_required_mapping_fails_job() {
    let (_db, db_path) = create_test_db().unwrap();
    let (_dir, csv) = write_csv("bad.csv", "Foo,Bar\n1,2\n");
    let (job_store, record_store) = open_stores(&db_path);
    let api = ImportApi::new(job_store, record_store, small_chunk_config(10));

    let job_id = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&api, &job_id).await, JobStatus::Failed);

    let view = api.get_job_status(&job_id).await.unwrap();
    assert!(view.message.unwrap_or_default().contains("supplier_name"));
}

#[tokio::test]
async fn test_invalid_submission_rejected() {
    let (_db, db_path) = create_test_db().unwrap();
    let (job_store, record_store) = open_stores(&db_path);
    let api = ImportApi::new(job_store, record_store, small_chunk_config(10));

    let err = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidInput(_)));

    let mut request = SubmitJobRequest::new(JobKind::Product, "/tmp/p.csv");
    request.batch_size = Some(0);
    let err = api.submit_job(request).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidInput(_)));

    let err = api.get_job_status("no-such-job").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

/// 目录查询总是失败
struct FailingCatalogStore {
    inner: Arc<SqliteRecordStore>,
}

#[async_trait]
impl RecordStore for FailingCatalogStore {
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Row>,
        conflict_key: &[&str],
    ) -> RepositoryResult<usize> {
        self.inner.upsert(table, rows, conflict_key).await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> RepositoryResult<usize> {
        self.inner.insert(table, rows).await
    }

    async fn query(&self, table: Table, filter: Filter) -> RepositoryResult<Vec<Row>> {
        if table == Table::Products {
            return Err(RepositoryError::DatabaseQueryError("catalog offline".to_string()));
        }
        self.inner.query(table, filter).await
    }

    async fn delete(&self, table: Table, filter: Filter) -> RepositoryResult<usize> {
        self.inner.delete(table, filter).await
    }

    async fn update(&self, table: Table, filter: Filter, fields: Row) -> RepositoryResult<usize> {
        self.inner.update(table, filter, fields).await
    }
}

#[tokio::test]
async fn test_catalog_fetch_failure_fails_job() {
    let (_db, db_path) = create_test_db().unwrap();
    let (_dir, csv) = write_csv("c.csv", "Supplier,EAN,Cost\nAcme,111,5\nAcme,222,6\n");
    let (job_store, record_store) = open_stores(&db_path);
    let failing = Arc::new(FailingCatalogStore { inner: record_store });
    let api = ImportApi::new(job_store, failing, small_chunk_config(10));

    let job_id = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&api, &job_id).await, JobStatus::Failed);

    let view = api.get_job_status(&job_id).await.unwrap();
    assert_eq!(view.progress, 100);
    let message = view.message.unwrap_or_default();
    assert!(message.contains("目录商品拉取失败"));
    assert!(message.contains("catalog offline"));
    assert_eq!(count_rows(&db_path, "supplier_products"), 0);
    assert_eq!(count_rows(&db_path, "suppliers"), 0);
}

// ==========================================
// 并发上限
// ==========================================

/// 目录查询在放行前阻塞
struct GatedRecordStore {
    inner: Arc<SqliteRecordStore>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl RecordStore for GatedRecordStore {
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Row>,
        conflict_key: &[&str],
    ) -> RepositoryResult<usize> {
        self.inner.upsert(table, rows, conflict_key).await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> RepositoryResult<usize> {
        self.inner.insert(table, rows).await
    }

    async fn query(&self, table: Table, filter: Filter) -> RepositoryResult<Vec<Row>> {
        if table == Table::Products {
            let _permit = self.gate.acquire().await;
        }
        self.inner.query(table, filter).await
    }

    async fn delete(&self, table: Table, filter: Filter) -> RepositoryResult<usize> {
        self.inner.delete(table, filter).await
    }

    async fn update(&self, table: Table, filter: Filter, fields: Row) -> RepositoryResult<usize> {
        self.inner.update(table, filter, fields).await
    }
}

#[tokio::test]
async fn test_queued_job_stays_pending() {
    let (_db, db_path) = create_test_db().unwrap();
    let (_dir, csv) = write_csv("q.csv", "Supplier,EAN,Cost\nAcme,111,5\n");
    let (job_store, record_store) = open_stores(&db_path);
    let gate = Arc::new(Semaphore::new(0));
    let gated = Arc::new(GatedRecordStore {
        inner: record_store,
        gate: Arc::clone(&gate),
    });

    let mut config = small_chunk_config(10);
    config.concurrency.max_concurrent_jobs = 1;
    let api = ImportApi::with_sampler(job_store, gated, config, Arc::new(FixedSampler(0)));

    let first = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();
    let second = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();

    // 等第一个任务进入 processing（阻塞在目录查询上）
    let mut started = false;
    for _ in 0..100 {
        if api.get_job_status(&first).await.unwrap().status == JobStatus::Processing {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started, "第一个任务应进入 processing");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.get_job_status(&second).await.unwrap().status, JobStatus::Pending);

    gate.add_permits(16);
    assert_eq!(wait_terminal(&api, &first).await, JobStatus::Completed);
    assert_eq!(wait_terminal(&api, &second).await, JobStatus::Completed);
}

// ==========================================
// 状态查询超时
// ==========================================

/// 开关打开后读取变慢
struct SlowJobStore {
    inner: Arc<SqliteJobStateStore>,
    slow: AtomicBool,
}

#[async_trait]
impl JobStateStore for SlowJobStore {
    async fn create(&self, job: &ImportJob) -> RepositoryResult<()> {
        self.inner.create(job).await
    }

    async fn get_by_id(&self, job_id: &str) -> RepositoryResult<Option<ImportJob>> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        self.inner.get_by_id(job_id).await
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> RepositoryResult<()> {
        self.inner.update(job_id, update).await
    }
}

#[tokio::test]
async fn test_status_query_timeout_returns_placeholder() {
    let (_db, db_path) = create_test_db().unwrap();
    let (_dir, csv) = write_csv("t.csv", "Supplier,EAN,Cost\nAcme,111,5\n");
    let (job_store, record_store) = open_stores(&db_path);
    let slow = Arc::new(SlowJobStore {
        inner: job_store,
        slow: AtomicBool::new(false),
    });

    let mut config = small_chunk_config(10);
    config.concurrency.status_query_timeout_ms = 100;
    let api = ImportApi::with_sampler(
        Arc::clone(&slow) as Arc<dyn JobStateStore>,
        record_store,
        config,
        Arc::new(FixedSampler(0)),
    );

    let job_id = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();
    api.wait_for_job(&job_id).await.unwrap();

    slow.slow.store(true, Ordering::SeqCst);
    let started = std::time::Instant::now();
    let view = api.get_job_status(&job_id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(view.synthetic);
    assert_eq!(view.status, JobStatus::Processing);
    assert_eq!(view.message.as_deref(), Some(STILL_PROCESSING_MESSAGE));

    slow.slow.store(false, Ordering::SeqCst);
    let view = api.get_job_status(&job_id).await.unwrap();
    assert!(!view.synthetic);
    assert_eq!(view.status, JobStatus::Completed);
}

// ==========================================
// 进度单调
// ==========================================

#[tokio::test]
async fn test_progress_never_regresses_while_polling() {
    let (_db, db_path) = create_test_db().unwrap();
    let mut content = String::from("Supplier,Product Name,EAN,Cost\n");
    for i in 0..400 {
        content.push_str(&format!("Supplier {},Item {},{},{}\n", i % 7, i, 100000 + i, i));
    }
    let (_dir, csv) = write_csv("big.csv", &content);
    let (job_store, record_store) = open_stores(&db_path);
    let api = ImportApi::with_sampler(
        job_store,
        record_store,
        small_chunk_config(20),
        Arc::new(FixedSampler(0)),
    );

    let job_id = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();

    let mut observed = Vec::new();
    loop {
        let view = api.get_job_status(&job_id).await.unwrap();
        if !view.synthetic {
            observed.push(view.progress);
        }
        if view.status.is_terminal() {
            assert_eq!(view.status, JobStatus::Completed);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    api.wait_for_job(&job_id).await.unwrap();

    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "进度回退: {:?}", observed);
    assert_eq!(observed.last(), Some(&100));

    let results = api.get_job_status(&job_id).await.unwrap().results.unwrap();
    assert_eq!(results.total_records, 400);
    assert_eq!(results.successful_imports, 400);
    assert_eq!(results.suppliers_added, 7);
}

// ==========================================
// 终结写入失败
// ==========================================

/// 拒绝携带统计结果的更新
struct RejectResultsJobStore {
    inner: Arc<SqliteJobStateStore>,
}

#[async_trait]
impl JobStateStore for RejectResultsJobStore {
    async fn create(&self, job: &ImportJob) -> RepositoryResult<()> {
        self.inner.create(job).await
    }

    async fn get_by_id(&self, job_id: &str) -> RepositoryResult<Option<ImportJob>> {
        self.inner.get_by_id(job_id).await
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> RepositoryResult<()> {
        if update.results.is_some() {
            return Err(RepositoryError::DatabaseQueryError("results rejected".to_string()));
        }
        self.inner.update(job_id, update).await
    }
}

#[tokio::test]
async fn test_finalize_failure_marks_job_failed() {
    let (_db, db_path) = create_test_db().unwrap();
    let (_dir, csv) = write_csv("f.csv", "Supplier,EAN,Cost\nAcme,111,5\n");
    let (job_store, record_store) = open_stores(&db_path);
    let rejecting = Arc::new(RejectResultsJobStore { inner: job_store });
    let api = ImportApi::new(rejecting, record_store, small_chunk_config(10));

    let job_id = api
        .submit_job(SubmitJobRequest::new(JobKind::Supplier, csv.to_str().unwrap()))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&api, &job_id).await, JobStatus::Failed);

    let view = api.get_job_status(&job_id).await.unwrap();
    assert_eq!(view.progress, 100);
    assert!(view.message.unwrap_or_default().contains("results rejected"));
    assert!(view.results.is_none());
}
