// ==========================================
// 供应商目录导入系统 - 导入配置对象
// ==========================================
// 职责: 各组件的显式配置，汇总为 ImportConfig
// 来源: 默认值 + config_kv 覆写（见 ConfigManager）
// ==========================================

use serde::{Deserialize, Serialize};

// ==========================================
// StreamConfig - 分块流读取
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub chunk_size: usize,      // 每块行数
    pub delimiter: Option<u8>,  // None = 按表头自动识别
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            delimiter: None,
        }
    }
}

// ==========================================
// PersistenceConfig - 批量写入
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub default_batch_size: usize,
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 500,
            max_batch_size: 1000,
        }
    }
}

impl PersistenceConfig {
    /// 实际批大小: clamp(请求值或默认值, 1, 上限)
    pub fn effective_batch_size(&self, requested: Option<usize>) -> usize {
        let max = self.max_batch_size.max(1);
        requested
            .filter(|v| *v > 0)
            .unwrap_or(self.default_batch_size)
            .clamp(1, max)
    }
}

// ==========================================
// GovernorConfig - 内存调速
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub high_water_bytes: u64,
    pub low_water_ratio: f64, // 低于 high_water * ratio 时减速步进回落
    pub sample_interval_ms: u64,
    pub throttle_step_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub failure_threshold: u32, // 连续失败分块数达到后强制加大延迟
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: 512 * 1024 * 1024,
            low_water_ratio: 0.7,
            sample_interval_ms: 500,
            throttle_step_ms: 50,
            min_delay_ms: 0,
            max_delay_ms: 2000,
            failure_threshold: 3,
        }
    }
}

// ==========================================
// TrackerConfig - 进度跟踪
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_failed_chunk_details: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_failed_chunk_details: 50,
        }
    }
}

// ==========================================
// ConcurrencyConfig - 任务并发与状态查询
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_jobs: usize,
    pub status_query_timeout_ms: u64,
    pub status_detail_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            status_query_timeout_ms: 2000,
            status_detail_limit: 10,
        }
    }
}

// ==========================================
// ImportConfig - 汇总配置
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub stream: StreamConfig,
    pub persistence: PersistenceConfig,
    pub governor: GovernorConfig,
    pub tracker: TrackerConfig,
    pub concurrency: ConcurrencyConfig,
}
