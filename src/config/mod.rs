// ==========================================
// 供应商目录导入系统 - 配置层
// ==========================================
// 职责: 导入配置对象 + config_kv 覆写读取
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod import_config;
pub mod import_config_trait;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager};
pub use import_config::{
    ConcurrencyConfig, GovernorConfig, ImportConfig, PersistenceConfig, StreamConfig,
    TrackerConfig,
};
pub use import_config_trait::{ConfigResult, ImportConfigReader};
