// ==========================================
// 供应商目录导入系统 - 导入任务领域模型
// ==========================================
// 职责: ImportJob / 匹配选项 / 结果汇总 / 部分更新
// 用途: 提交端创建，导入管道独占修改，永不删除
// ==========================================

use crate::domain::types::{JobKind, JobStatus, MatchMethod, MatchStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ==========================================
// MatchOptions - 匹配选项
// ==========================================
// 启用的策略 + 优先级顺序
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    #[serde(alias = "useEan")]
    pub use_ean: bool,
    #[serde(alias = "useMpn")]
    pub use_mpn: bool,
    #[serde(alias = "useName")]
    pub use_name: bool,
    pub priority: Vec<MatchStrategy>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            use_ean: true,
            use_mpn: true,
            use_name: true,
            priority: MatchStrategy::ALL.to_vec(),
        }
    }
}

impl MatchOptions {
    pub fn is_enabled(&self, strategy: MatchStrategy) -> bool {
        match strategy {
            MatchStrategy::Ean => self.use_ean,
            MatchStrategy::Mpn => self.use_mpn,
            MatchStrategy::Name => self.use_name,
        }
    }

    /// 实际生效的策略顺序
    ///
    /// - priority 中的策略按出现顺序（去重、过滤未启用项）
    /// - 已启用但未出现在 priority 中的策略追加到末尾（默认顺序）
    pub fn effective_order(&self) -> Vec<MatchStrategy> {
        let mut order = Vec::with_capacity(3);
        for strategy in self.priority.iter().chain(MatchStrategy::ALL.iter()) {
            if self.is_enabled(*strategy) && !order.contains(strategy) {
                order.push(*strategy);
            }
        }
        order
    }
}

// ==========================================
// MatchStats - 匹配统计
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCounts {
    pub ean: u64,
    pub mpn: u64,
    pub name: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    pub total_matched: u64,
    pub by_method: MethodCounts,
    pub unmatched_count: u64,
}

impl MatchStats {
    pub fn record(&mut self, method: MatchMethod) {
        match method {
            MatchMethod::Ean => self.by_method.ean += 1,
            MatchMethod::Mpn => self.by_method.mpn += 1,
            MatchMethod::Name => self.by_method.name += 1,
            MatchMethod::None => {
                self.unmatched_count += 1;
                return;
            }
        }
        self.total_matched += 1;
    }

    pub fn merge(&mut self, other: &MatchStats) {
        self.total_matched += other.total_matched;
        self.by_method.ean += other.by_method.ean;
        self.by_method.mpn += other.by_method.mpn;
        self.by_method.name += other.by_method.name;
        self.unmatched_count += other.unmatched_count;
    }
}

// ==========================================
// FailedChunkDetail - 分块失败明细
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChunkDetail {
    pub chunk_index: u64,
    pub first_row: u64,           // 分块首行（文件行号，1 = 第一条数据行）
    pub last_row: u64,            // 分块末行
    pub rows_affected: u64,       // 因本次失败而未落库的行数
    pub stage: String,            // 失败阶段（suppliers / matched_links / unmatched_links / products）
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

// ==========================================
// JobResults - 导入结果汇总
// ==========================================
// 对账: total_records == successful_imports + failed_imports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub total_records: u64,
    pub successful_imports: u64,
    pub failed_imports: u64,

    // failed_imports 的构成
    pub skipped_rows: u64,   // 必填字段缺失 / 空行
    pub malformed_rows: u64, // 解析失败行
    pub duplicate_rows: u64, // 同一次导入内重复 EAN（商品导入）

    pub suppliers_added: u64,
    pub products_upserted: u64,
    pub match_stats: MatchStats,

    pub failed_chunk_count: u64,
    pub failed_chunk_details: Vec<FailedChunkDetail>,
}

impl JobResults {
    /// 对账是否成立
    pub fn is_reconciled(&self) -> bool {
        self.total_records == self.successful_imports + self.failed_imports
    }

    /// 生成截断明细后的摘要（状态接口使用）
    pub fn summarized(&self, detail_limit: usize) -> JobResults {
        let mut summary = self.clone();
        summary.failed_chunk_details.truncate(detail_limit);
        summary
    }
}

// ==========================================
// ImportJob - 导入任务
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub status_message: Option<String>,

    // ===== 提交参数 =====
    pub file_name: String,
    pub source_file_path: String,
    pub field_mapping: BTreeMap<String, String>, // 标准字段 → 源表头
    pub match_options: MatchOptions,
    pub match_column_overrides: BTreeMap<MatchStrategy, String>, // 策略 → 匹配用源表头
    pub custom_attributes: Vec<String>,
    pub batch_size: Option<usize>,

    // ===== 执行结果 =====
    pub total_rows_estimate: Option<u64>,
    pub results: Option<JobResults>,

    // ===== 时间戳 =====
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// 创建新的待处理任务
    pub fn new_pending(kind: JobKind, source_file_path: impl Into<String>) -> Self {
        let source_file_path = source_file_path.into();
        let file_name = std::path::Path::new(&source_file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Pending,
            progress: 0,
            status_message: None,
            file_name,
            source_file_path,
            field_mapping: BTreeMap::new(),
            match_options: MatchOptions::default(),
            match_column_overrides: BTreeMap::new(),
            custom_attributes: Vec::new(),
            batch_size: None,
            total_rows_estimate: None,
            results: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ==========================================
// JobUpdate - 任务部分字段更新
// ==========================================
// 只写入 Some 字段，单行原子更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub status_message: Option<String>,
    pub total_rows_estimate: Option<u64>,
    pub results: Option<JobResults>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn total_rows_estimate(mut self, estimate: u64) -> Self {
        self.total_rows_estimate = Some(estimate);
        self
    }

    pub fn results(mut self, results: JobResults) -> Self {
        self.results = Some(results);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == JobUpdate::default()
    }
}

// ==========================================
// JobStatusView - 状态查询视图
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub total_rows_estimate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<JobResults>,
    /// 查询超时时返回的占位视图
    pub synthetic: bool,
}
