// ==========================================
// 供应商目录导入系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 任务状态存储 + 记录存储，屏蔽数据库细节
// 约束: 所有查询使用参数化，列名走白名单
// ==========================================

pub mod error;
pub mod job_store;
pub mod job_store_impl;
pub mod record_store;
pub mod record_store_impl;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use job_store::JobStateStore;
pub use job_store_impl::SqliteJobStateStore;
pub use record_store::{ColumnKind, Filter, RecordStore, Row, Table};
pub use record_store_impl::SqliteRecordStore;
