// ==========================================
// 供应商目录导入系统 - 导入配置读取 Trait
// ==========================================
// 职责: 定义导入管道所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::config::import_config::{
    ConcurrencyConfig, GovernorConfig, ImportConfig, PersistenceConfig, StreamConfig,
    TrackerConfig,
};
use async_trait::async_trait;
use std::error::Error;

/// 配置读取结果
pub type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

// ==========================================
// ImportConfigReader Trait
// ==========================================
// 用途: 导入管道所需的配置读取接口
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ImportConfigReader: Send + Sync {
    // ===== 流读取 =====

    /// 获取分块行数
    ///
    /// # 默认值
    /// - 500
    async fn get_chunk_size(&self) -> ConfigResult<usize>;

    /// 获取分隔符（None = 自动识别）
    async fn get_delimiter(&self) -> ConfigResult<Option<u8>>;

    // ===== 批量写入 =====

    /// 获取默认批大小
    ///
    /// # 默认值
    /// - 500
    async fn get_default_batch_size(&self) -> ConfigResult<usize>;

    /// 获取批大小上限
    ///
    /// # 默认值
    /// - 1000
    async fn get_max_batch_size(&self) -> ConfigResult<usize>;

    // ===== 内存调速 =====

    /// 获取内存高水位（MB）
    ///
    /// # 默认值
    /// - 512
    async fn get_memory_high_water_mb(&self) -> ConfigResult<u64>;

    async fn get_memory_sample_interval_ms(&self) -> ConfigResult<u64>;

    async fn get_throttle_step_ms(&self) -> ConfigResult<u64>;

    async fn get_max_throttle_delay_ms(&self) -> ConfigResult<u64>;

    /// 获取连续失败阈值
    ///
    /// # 默认值
    /// - 3
    async fn get_failure_threshold(&self) -> ConfigResult<u32>;

    // ===== 进度与状态 =====

    async fn get_max_failed_chunk_details(&self) -> ConfigResult<usize>;

    async fn get_status_query_timeout_ms(&self) -> ConfigResult<u64>;

    async fn get_status_detail_limit(&self) -> ConfigResult<usize>;

    // ===== 并发 =====

    /// 获取最大并发任务数
    ///
    /// # 默认值
    /// - 2
    async fn get_max_concurrent_jobs(&self) -> ConfigResult<usize>;

    /// 汇总为 ImportConfig
    async fn load_import_config(&self) -> ConfigResult<ImportConfig> {
        Ok(ImportConfig {
            stream: StreamConfig {
                chunk_size: self.get_chunk_size().await?,
                delimiter: self.get_delimiter().await?,
            },
            persistence: PersistenceConfig {
                default_batch_size: self.get_default_batch_size().await?,
                max_batch_size: self.get_max_batch_size().await?,
            },
            governor: GovernorConfig {
                high_water_bytes: self.get_memory_high_water_mb().await? * 1024 * 1024,
                sample_interval_ms: self.get_memory_sample_interval_ms().await?,
                throttle_step_ms: self.get_throttle_step_ms().await?,
                max_delay_ms: self.get_max_throttle_delay_ms().await?,
                failure_threshold: self.get_failure_threshold().await?,
                ..GovernorConfig::default()
            },
            tracker: TrackerConfig {
                max_failed_chunk_details: self.get_max_failed_chunk_details().await?,
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_jobs: self.get_max_concurrent_jobs().await?,
                status_query_timeout_ms: self.get_status_query_timeout_ms().await?,
                status_detail_limit: self.get_status_detail_limit().await?,
            },
        })
    }
}
