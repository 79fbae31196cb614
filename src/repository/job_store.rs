// ==========================================
// 供应商目录导入系统 - 任务状态存储 Trait
// ==========================================
// 职责: ImportJob 的创建 / 查询 / 单行原子更新
// 红线: 不做多行事务；状态机校验在实现内完成
// ==========================================

use crate::domain::job::{ImportJob, JobUpdate};
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;

// ==========================================
// JobStateStore Trait
// ==========================================
// 实现者: SqliteJobStateStore（使用 rusqlite）
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// 创建任务记录
    async fn create(&self, job: &ImportJob) -> RepositoryResult<()>;

    /// 按 ID 查询任务
    ///
    /// # 返回
    /// - Ok(Some(job)): 任务存在
    /// - Ok(None): 任务不存在
    async fn get_by_id(&self, id: &str) -> RepositoryResult<Option<ImportJob>>;

    /// 部分字段更新
    ///
    /// # 返回
    /// - Err(NotFound): 任务不存在
    /// - Err(InvalidStateTransition): 非法状态转换 / 终态任务被修改
    async fn update(&self, id: &str, update: JobUpdate) -> RepositoryResult<()>;
}
