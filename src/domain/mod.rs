// ==========================================
// 供应商目录导入系统 - 领域模型层
// ==========================================
// 职责: 定义导入任务、目录商品、供应商等领域实体与类型
// 红线: 不含数据访问逻辑,不含导入流程逻辑
// ==========================================

pub mod catalog;
pub mod job;
pub mod supplier;
pub mod types;

// 重导出核心类型
pub use catalog::{CandidateProduct, ProductRecord};
pub use job::{
    FailedChunkDetail, ImportJob, JobResults, JobStatusView, JobUpdate, MatchOptions,
    MatchStats, MethodCounts,
};
pub use supplier::{
    MatchKeys, SupplierGroup, SupplierLineItem, SupplierProductLink, SupplierRecord,
};
pub use types::{JobKind, JobStatus, MatchMethod, MatchStrategy};
