// ==========================================
// 供应商目录导入系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::import_config::ImportConfig;
use crate::config::import_config_trait::{ConfigResult, ImportConfigReader};
use crate::db::open_sqlite_connection;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::warn;

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
    defaults: ImportConfig,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> ConfigResult<Self> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            defaults: ImportConfig::default(),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ConfigResult<Self> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self {
            conn,
            defaults: ImportConfig::default(),
        })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    fn get_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> ConfigResult<()> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at)
             VALUES ('global', ?1, ?2, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 获取所有 global 配置（按 key 排序）
    pub fn get_config_snapshot(&self) -> ConfigResult<BTreeMap<String, String>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            snapshot.insert(key, value);
        }
        Ok(snapshot)
    }

    /// 读取并解析正数配置，缺失或非法时回退默认值
    fn get_positive<T>(&self, key: &str, default: T) -> ConfigResult<T>
    where
        T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
    {
        let Some(raw) = self.get_config_value(key)? else {
            return Ok(default);
        };
        match raw.trim().parse::<T>() {
            Ok(v) if v > T::default() => Ok(v),
            _ => {
                warn!(key, value = %raw, default = %default, "配置值非法，使用默认值");
                Ok(default)
            }
        }
    }
}

/// 解析分隔符配置: auto / 空 → None；tab / \t → 制表符；单个 ASCII 字符
pub fn parse_delimiter(raw: &str) -> Result<Option<u8>, String> {
    if raw == "\t" {
        return Ok(Some(b'\t'));
    }
    let value = raw.trim();
    match value.to_lowercase().as_str() {
        "" | "auto" => return Ok(None),
        "tab" | "\\t" => return Ok(Some(b'\t')),
        _ => {}
    }
    let bytes = value.as_bytes();
    if bytes.len() == 1 && bytes[0].is_ascii() && !bytes[0].is_ascii_alphanumeric() {
        Ok(Some(bytes[0]))
    } else {
        Err(format!("无效的分隔符: {}", raw))
    }
}

#[async_trait]
impl ImportConfigReader for ConfigManager {
    // ===== 流读取 =====

    async fn get_chunk_size(&self) -> ConfigResult<usize> {
        self.get_positive(config_keys::CHUNK_SIZE, self.defaults.stream.chunk_size)
    }

    async fn get_delimiter(&self) -> ConfigResult<Option<u8>> {
        let Some(raw) = self.get_config_value(config_keys::DELIMITER)? else {
            return Ok(self.defaults.stream.delimiter);
        };
        match parse_delimiter(&raw) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, "分隔符配置非法，改为自动识别");
                Ok(None)
            }
        }
    }

    // ===== 批量写入 =====

    async fn get_default_batch_size(&self) -> ConfigResult<usize> {
        self.get_positive(
            config_keys::DEFAULT_BATCH_SIZE,
            self.defaults.persistence.default_batch_size,
        )
    }

    async fn get_max_batch_size(&self) -> ConfigResult<usize> {
        self.get_positive(
            config_keys::MAX_BATCH_SIZE,
            self.defaults.persistence.max_batch_size,
        )
    }

    // ===== 内存调速 =====

    async fn get_memory_high_water_mb(&self) -> ConfigResult<u64> {
        self.get_positive(
            config_keys::MEMORY_HIGH_WATER_MB,
            self.defaults.governor.high_water_bytes / (1024 * 1024),
        )
    }

    async fn get_memory_sample_interval_ms(&self) -> ConfigResult<u64> {
        self.get_positive(
            config_keys::MEMORY_SAMPLE_INTERVAL_MS,
            self.defaults.governor.sample_interval_ms,
        )
    }

    async fn get_throttle_step_ms(&self) -> ConfigResult<u64> {
        self.get_positive(
            config_keys::THROTTLE_STEP_MS,
            self.defaults.governor.throttle_step_ms,
        )
    }

    async fn get_max_throttle_delay_ms(&self) -> ConfigResult<u64> {
        self.get_positive(
            config_keys::MAX_THROTTLE_DELAY_MS,
            self.defaults.governor.max_delay_ms,
        )
    }

    async fn get_failure_threshold(&self) -> ConfigResult<u32> {
        self.get_positive(
            config_keys::FAILURE_THRESHOLD,
            self.defaults.governor.failure_threshold,
        )
    }

    // ===== 进度与状态 =====

    async fn get_max_failed_chunk_details(&self) -> ConfigResult<usize> {
        self.get_positive(
            config_keys::MAX_FAILED_CHUNK_DETAILS,
            self.defaults.tracker.max_failed_chunk_details,
        )
    }

    async fn get_status_query_timeout_ms(&self) -> ConfigResult<u64> {
        self.get_positive(
            config_keys::STATUS_QUERY_TIMEOUT_MS,
            self.defaults.concurrency.status_query_timeout_ms,
        )
    }

    async fn get_status_detail_limit(&self) -> ConfigResult<usize> {
        self.get_positive(
            config_keys::STATUS_DETAIL_LIMIT,
            self.defaults.concurrency.status_detail_limit,
        )
    }

    // ===== 并发 =====

    async fn get_max_concurrent_jobs(&self) -> ConfigResult<usize> {
        self.get_positive(
            config_keys::MAX_CONCURRENT_JOBS,
            self.defaults.concurrency.max_concurrent_jobs,
        )
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 流读取
    pub const CHUNK_SIZE: &str = "import/chunk_size";
    pub const DELIMITER: &str = "import/delimiter";

    // 批量写入
    pub const DEFAULT_BATCH_SIZE: &str = "import/default_batch_size";
    pub const MAX_BATCH_SIZE: &str = "import/max_batch_size";

    // 内存调速
    pub const MEMORY_HIGH_WATER_MB: &str = "import/memory_high_water_mb";
    pub const MEMORY_SAMPLE_INTERVAL_MS: &str = "import/memory_sample_interval_ms";
    pub const THROTTLE_STEP_MS: &str = "import/throttle_step_ms";
    pub const MAX_THROTTLE_DELAY_MS: &str = "import/max_throttle_delay_ms";
    pub const FAILURE_THRESHOLD: &str = "import/failure_threshold";

    // 进度与状态
    pub const MAX_FAILED_CHUNK_DETAILS: &str = "import/max_failed_chunk_details";
    pub const STATUS_QUERY_TIMEOUT_MS: &str = "import/status_query_timeout_ms";
    pub const STATUS_DETAIL_LIMIT: &str = "import/status_detail_limit";

    // 并发
    pub const MAX_CONCURRENT_JOBS: &str = "import/max_concurrent_jobs";
}
