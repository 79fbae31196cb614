// ==========================================
// 供应商目录导入系统 - 领域类型定义
// ==========================================
// 职责: 任务类型 / 任务状态 / 匹配方式等枚举
// 序列化格式: snake_case（与数据库、状态接口一致）
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ==========================================
// 导入任务类型 (Job Kind)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Supplier, // 供应商报价文件
    Product,  // 目录商品文件
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Supplier => "supplier",
            JobKind::Product => "product",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "supplier" => Ok(JobKind::Supplier),
            "product" => Ok(JobKind::Product),
            other => Err(format!("未知的导入类型: {}", other)),
        }
    }
}

// ==========================================
// 导入任务状态 (Job Status)
// ==========================================
// 状态机: pending → processing → {completed | completed_with_errors | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,             // 已提交，等待执行
    Processing,          // 执行中
    Completed,           // 全部分块成功
    CompletedWithErrors, // 读到文件末尾，但至少一个分块写入失败
    Failed,              // 致命错误（文件不可读/表头解析失败/目录拉取失败）
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// 状态转换是否合法
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            // 启动前即失败（例如文件已被删除）
            (JobStatus::Pending, JobStatus::Failed) => true,
            (JobStatus::Processing, JobStatus::Processing) => true,
            (JobStatus::Processing, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("未知的任务状态: {}", other)),
        }
    }
}

// ==========================================
// 匹配策略 (Match Strategy)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Ean,  // 条码精确匹配
    Mpn,  // 制造商料号（规范化 + 模糊）
    Name, // 商品名称（精确 + 子串）
}

impl MatchStrategy {
    pub const ALL: [MatchStrategy; 3] = [MatchStrategy::Ean, MatchStrategy::Mpn, MatchStrategy::Name];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Ean => "ean",
            MatchStrategy::Mpn => "mpn",
            MatchStrategy::Name => "name",
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ean" => Ok(MatchStrategy::Ean),
            "mpn" => Ok(MatchStrategy::Mpn),
            "name" | "title" | "product_name" => Ok(MatchStrategy::Name),
            other => Err(format!("未知的匹配策略: {}", other)),
        }
    }
}

// ==========================================
// 匹配方式 (Match Method)
// ==========================================
// 红线: 落库的每条供应商商品都必须有 match_method
// product_id 为空 ⇔ match_method = none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Ean,
    Mpn,
    Name,
    None,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Ean => "ean",
            MatchMethod::Mpn => "mpn",
            MatchMethod::Name => "name",
            MatchMethod::None => "none",
        }
    }

    pub fn is_matched(&self) -> bool {
        !matches!(self, MatchMethod::None)
    }
}

impl From<MatchStrategy> for MatchMethod {
    fn from(strategy: MatchStrategy) -> Self {
        match strategy {
            MatchStrategy::Ean => MatchMethod::Ean,
            MatchStrategy::Mpn => MatchMethod::Mpn,
            MatchStrategy::Name => MatchMethod::Name,
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ean" => Ok(MatchMethod::Ean),
            "mpn" => Ok(MatchMethod::Mpn),
            "name" => Ok(MatchMethod::Name),
            "none" => Ok(MatchMethod::None),
            other => Err(format!("未知的匹配方式: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::CompletedWithErrors));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_match_method_serde_is_snake_case() {
        let json = serde_json::to_string(&MatchMethod::None).unwrap();
        assert_eq!(json, "\"none\"");
        assert_eq!(MatchMethod::from(MatchStrategy::Mpn), MatchMethod::Mpn);
        assert!(!MatchMethod::None.is_matched());
    }
}
