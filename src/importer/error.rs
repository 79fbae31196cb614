// ==========================================
// 供应商目录导入系统 - 导入模块错误类型
// ==========================================
// 工具: thiserror 派生宏
// 分类: 致命错误（任务 failed）/ 批次写入错误（记录后继续）
// ==========================================

use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 导入模块错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 文件相关错误（致命）=====
    #[error("文件不存在: {0}")]
    FileNotFound(String),

    #[error("文件读取失败: {0}")]
    FileReadError(String),

    #[error("表头解析失败: {0}")]
    HeaderParseError(String),

    #[error("CSV 解析失败: {0}")]
    CsvParseError(String),

    // ===== 映射错误（致命）=====
    #[error("必填字段未映射: {}", .fields.join(", "))]
    MissingFieldMapping { fields: Vec<String> },

    // ===== 目录拉取错误（致命）=====
    #[error("目录商品拉取失败: {0}")]
    CatalogFetchError(String),

    // ===== 批次写入错误（非致命）=====
    #[error("批次写入失败 (阶段 {stage}, {rows} 行): {message}")]
    BatchWriteError {
        stage: String,
        rows: usize,
        message: String,
    },

    // ===== 任务状态错误 =====
    #[error("任务状态写入失败: {0}")]
    JobStateError(String),

    #[error("任务已终结，拒绝重复终结: {0}")]
    AlreadyFinalized(String),

    // ===== 通用错误 =====
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    /// 是否为致命错误（任务直接 failed）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ImportError::BatchWriteError { .. })
    }
}

// 实现 From<std::io::Error>
impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ImportError::FileNotFound(err.to_string())
        } else {
            ImportError::FileReadError(err.to_string())
        }
    }
}

// 实现 From<csv::Error>
impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            return ImportError::FileReadError(err.to_string());
        }
        ImportError::CsvParseError(err.to_string())
    }
}

// 实现 From<rusqlite::Error>
impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        ImportError::JobStateError(err.to_string())
    }
}

// 实现 From<serde_json::Error>
impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::InternalError(format!("JSON 序列化失败: {}", err))
    }
}

// 实现 From<RepositoryError>
impl From<RepositoryError> for ImportError {
    fn from(err: RepositoryError) -> Self {
        ImportError::JobStateError(err.to_string())
    }
}

// 实现 From<tokio::task::JoinError>
impl From<tokio::task::JoinError> for ImportError {
    fn from(err: tokio::task::JoinError) -> Self {
        ImportError::InternalError(format!("后台任务异常退出: {}", err))
    }
}

/// Result 类型别名
pub type ImportResult<T> = Result<T, ImportError>;
