// ==========================================
// 供应商目录导入系统 - 任务状态存储 SQLite 实现
// ==========================================
// 职责: JobStateStore 的 rusqlite 实现
// 存储: import_jobs 表（映射 / 选项 / 结果以 JSON 存储）
// ==========================================

use crate::db::open_sqlite_connection;
use crate::domain::job::{ImportJob, JobUpdate};
use crate::domain::types::{JobKind, JobStatus};
use crate::perf::{install_sqlite_tracing, PerfGuard};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::job_store::JobStateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const JOB_COLUMNS: &str = "id, kind, status, progress, status_message, file_name, source_file_path, \
     field_mapping, match_options, match_column_overrides, custom_attributes, batch_size, \
     total_rows_estimate, results, created_at, started_at, updated_at, completed_at";

// ==========================================
// SqliteJobStateStore
// ==========================================
pub struct SqliteJobStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStateStore {
    /// 创建新的 Repository 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let mut conn = open_sqlite_connection(db_path)
            .map_err(|e| RepositoryError::DatabaseConnectionError(e.to_string()))?;
        install_sqlite_tracing(&mut conn);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从共享连接创建
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    async fn with_conn<T, F>(&self, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> RepositoryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| RepositoryError::LockError(format!("锁获取失败: {}", e)))?;
            f(&mut guard)
        })
        .await?
    }
}

fn parse_time(raw: Option<String>) -> RepositoryResult<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RepositoryError::FieldValueError {
                field: "timestamp".to_string(),
                message: format!("{}: {}", s, e),
            })
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(field: &str, raw: &str) -> RepositoryResult<T> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::FieldValueError {
        field: field.to_string(),
        message: e.to_string(),
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(field: &str, raw: &str) -> RepositoryResult<T> {
    raw.parse::<T>().map_err(|message| RepositoryError::FieldValueError {
        field: field.to_string(),
        message,
    })
}

/// 原始行（先取出全部列，再做解析，便于返回结构化错误）
struct JobRow {
    id: String,
    kind: String,
    status: String,
    progress: i64,
    status_message: Option<String>,
    file_name: String,
    source_file_path: String,
    field_mapping: String,
    match_options: String,
    match_column_overrides: String,
    custom_attributes: String,
    batch_size: Option<i64>,
    total_rows_estimate: Option<i64>,
    results: Option<String>,
    created_at: String,
    started_at: Option<String>,
    updated_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            progress: row.get(3)?,
            status_message: row.get(4)?,
            file_name: row.get(5)?,
            source_file_path: row.get(6)?,
            field_mapping: row.get(7)?,
            match_options: row.get(8)?,
            match_column_overrides: row.get(9)?,
            custom_attributes: row.get(10)?,
            batch_size: row.get(11)?,
            total_rows_estimate: row.get(12)?,
            results: row.get(13)?,
            created_at: row.get(14)?,
            started_at: row.get(15)?,
            updated_at: row.get(16)?,
            completed_at: row.get(17)?,
        })
    }

    fn into_job(self) -> RepositoryResult<ImportJob> {
        let created_at = parse_time(Some(self.created_at))?.unwrap_or_else(Utc::now);
        let updated_at = parse_time(Some(self.updated_at))?.unwrap_or(created_at);

        Ok(ImportJob {
            id: self.id,
            kind: parse_enum::<JobKind>("kind", &self.kind)?,
            status: parse_enum::<JobStatus>("status", &self.status)?,
            progress: self.progress.clamp(0, 100) as u8,
            status_message: self.status_message,
            file_name: self.file_name,
            source_file_path: self.source_file_path,
            field_mapping: parse_json("field_mapping", &self.field_mapping)?,
            match_options: parse_json("match_options", &self.match_options)?,
            match_column_overrides: parse_json("match_column_overrides", &self.match_column_overrides)?,
            custom_attributes: parse_json("custom_attributes", &self.custom_attributes)?,
            batch_size: self.batch_size.and_then(|v| usize::try_from(v).ok()),
            total_rows_estimate: self.total_rows_estimate.and_then(|v| u64::try_from(v).ok()),
            results: self
                .results
                .as_deref()
                .map(|raw| parse_json("results", raw))
                .transpose()?,
            created_at,
            started_at: parse_time(self.started_at)?,
            updated_at,
            completed_at: parse_time(self.completed_at)?,
        })
    }
}

fn load_job(conn: &Connection, id: &str) -> RepositoryResult<Option<ImportJob>> {
    let sql = format!("SELECT {} FROM import_jobs WHERE id = ?1", JOB_COLUMNS);
    let raw = conn
        .query_row(&sql, params![id], JobRow::from_row)
        .optional()?;
    raw.map(JobRow::into_job).transpose()
}

#[async_trait]
impl JobStateStore for SqliteJobStateStore {
    async fn create(&self, job: &ImportJob) -> RepositoryResult<()> {
        let job = job.clone();
        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("job_store.create");
            let results = job.results.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                &format!(
                    "INSERT INTO import_jobs ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    JOB_COLUMNS
                ),
                params![
                    job.id,
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.progress as i64,
                    job.status_message,
                    job.file_name,
                    job.source_file_path,
                    serde_json::to_string(&job.field_mapping)?,
                    serde_json::to_string(&job.match_options)?,
                    serde_json::to_string(&job.match_column_overrides)?,
                    serde_json::to_string(&job.custom_attributes)?,
                    job.batch_size.map(|v| v as i64),
                    job.total_rows_estimate.map(|v| v as i64),
                    results,
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: &str) -> RepositoryResult<Option<ImportJob>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("job_store.get_by_id");
            load_job(conn, &id)
        })
        .await
    }

    async fn update(&self, id: &str, update: JobUpdate) -> RepositoryResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let id = id.to_string();

        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("job_store.update");
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM import_jobs WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let current = match current {
                Some(raw) => parse_enum::<JobStatus>("status", &raw)?,
                None => {
                    return Err(RepositoryError::NotFound {
                        entity: "ImportJob".to_string(),
                        id,
                    })
                }
            };

            // ===== 状态机校验 =====
            let next = update.status.unwrap_or(current);
            let allowed = match update.status {
                Some(next) => current.can_transition_to(next),
                None => !current.is_terminal(),
            };
            if !allowed {
                return Err(RepositoryError::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }

            let mut assignments: Vec<&str> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();

            if let Some(status) = update.status {
                assignments.push("status = ?");
                values.push(SqlValue::Text(status.as_str().to_string()));
            }
            if let Some(progress) = update.progress {
                assignments.push("progress = ?");
                values.push(SqlValue::Integer(i64::from(progress.min(100))));
            }
            if let Some(message) = update.status_message {
                assignments.push("status_message = ?");
                values.push(SqlValue::Text(message));
            }
            if let Some(estimate) = update.total_rows_estimate {
                assignments.push("total_rows_estimate = ?");
                values.push(SqlValue::Integer(estimate as i64));
            }
            if let Some(results) = update.results {
                assignments.push("results = ?");
                values.push(SqlValue::Text(serde_json::to_string(&results)?));
            }
            if let Some(started_at) = update.started_at {
                assignments.push("started_at = ?");
                values.push(SqlValue::Text(started_at.to_rfc3339()));
            }
            if let Some(completed_at) = update.completed_at {
                assignments.push("completed_at = ?");
                values.push(SqlValue::Text(completed_at.to_rfc3339()));
            }
            assignments.push("updated_at = ?");
            values.push(SqlValue::Text(Utc::now().to_rfc3339()));
            values.push(SqlValue::Text(id));

            let sql = format!("UPDATE import_jobs SET {} WHERE id = ?", assignments.join(", "));
            conn.execute(&sql, params_from_iter(values))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;
    use crate::domain::job::JobResults;
    use crate::domain::types::MatchStrategy;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, SqliteJobStateStore) {
        let file = NamedTempFile::new().unwrap();
        let conn = open_sqlite_connection(file.path().to_str().unwrap()).unwrap();
        init_schema(&conn).unwrap();
        (file, SqliteJobStateStore::from_connection(Arc::new(Mutex::new(conn))))
    }

    #[tokio::test]
    async fn test_create_and_load_round_trip() {
        let (_file, store) = store();
        let mut job = ImportJob::new_pending(JobKind::Supplier, "/data/acme.csv");
        job.field_mapping.insert("supplier_name".to_string(), "Vendor".to_string());
        job.match_column_overrides.insert(MatchStrategy::Mpn, "Alt".to_string());
        job.batch_size = Some(250);
        store.create(&job).await.unwrap();

        let loaded = store.get_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, JobKind::Supplier);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.field_mapping, job.field_mapping);
        assert_eq!(loaded.match_column_overrides, job.match_column_overrides);
        assert_eq!(loaded.batch_size, Some(250));
        assert!(store.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_enforces_state_machine() {
        let (_file, store) = store();
        let job = ImportJob::new_pending(JobKind::Product, "/data/p.csv");
        store.create(&job).await.unwrap();

        let err = store
            .update(&job.id, JobUpdate::default().status(JobStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidStateTransition { .. }));

        store
            .update(&job.id, JobUpdate::default().status(JobStatus::Processing).progress(1))
            .await
            .unwrap();
        store
            .update(
                &job.id,
                JobUpdate::default()
                    .status(JobStatus::Completed)
                    .progress(100)
                    .results(JobResults::default())
                    .completed_at(Utc::now()),
            )
            .await
            .unwrap();

        let loaded = store.get_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.progress, 100);
        assert!(loaded.results.is_some());
        assert!(loaded.completed_at.is_some());

        let err = store
            .update(&job.id, JobUpdate::default().progress(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let (_file, store) = store();
        let err = store
            .update("nope", JobUpdate::default().progress(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }
}
