// ==========================================
// 供应商目录导入系统 - API 层
// ==========================================
// 职责: 任务提交与状态查询接口，供 CLI / 外部服务调用
// ==========================================

pub mod error;
pub mod import_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use import_api::{ImportApi, SubmitJobRequest, STILL_PROCESSING_MESSAGE};
