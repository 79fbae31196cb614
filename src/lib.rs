// ==========================================
// 供应商目录导入系统 - 核心库
// ==========================================
// 技术栈: Rust + tokio + SQLite
// 系统定位: 供应商报价 / 目录商品的流式批量导入与身份匹配
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 导入层 - 流式导入流水线
pub mod importer;

// 配置层 - 导入配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/建表）
pub mod db;

// 日志系统
pub mod logging;

// SQL 性能统计
pub mod perf;

// API 层 - 任务提交与状态查询
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{JobKind, JobStatus, MatchMethod, MatchStrategy};

// 领域实体
pub use domain::{ImportJob, JobResults, JobStatusView, MatchOptions};

// 导入
pub use importer::{ImportError, ImportPipeline};

// API
pub use api::{ApiError, ImportApi, SubmitJobRequest};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "供应商目录导入系统";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
