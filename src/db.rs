// ==========================================
// 供应商目录导入系统 - SQLite 连接与建表
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键 + busy_timeout）
// - 幂等建表（CREATE TABLE IF NOT EXISTS，不做迁移）
// ==========================================

use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 数据库路径环境变量
pub const DB_PATH_ENV: &str = "SUPPLIER_IMPORT_DB_PATH";

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 默认数据库路径
///
/// 优先读取 `SUPPLIER_IMPORT_DB_PATH`，否则放在系统数据目录下
pub fn get_default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("supplier-catalog-import")
        .join("import.db")
}

/// 建表（幂等）
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS import_jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('supplier', 'product')),
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            status_message TEXT,
            file_name TEXT NOT NULL,
            source_file_path TEXT NOT NULL,
            field_mapping TEXT NOT NULL DEFAULT '{}',
            match_options TEXT NOT NULL DEFAULT '{}',
            match_column_overrides TEXT NOT NULL DEFAULT '{}',
            custom_attributes TEXT NOT NULL DEFAULT '[]',
            batch_size INTEGER,
            total_rows_estimate INTEGER,
            results TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ean TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL DEFAULT '',
            mpn TEXT,
            custom_mpn TEXT,
            asin TEXT,
            upc TEXT,
            brand TEXT,
            category TEXT,
            sale_price REAL NOT NULL DEFAULT 0,
            amazon_fee REAL NOT NULL DEFAULT 0,
            fba_fees REAL NOT NULL DEFAULT 0,
            referral_fee REAL NOT NULL DEFAULT 0,
            buy_box_price REAL NOT NULL DEFAULT 0,
            units_sold INTEGER NOT NULL DEFAULT 0,
            rating REAL,
            review_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS suppliers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            custom_attributes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS supplier_products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            supplier_id INTEGER NOT NULL REFERENCES suppliers(id) ON DELETE CASCADE,
            product_id INTEGER REFERENCES products(id),
            ean TEXT NOT NULL CHECK (length(ean) > 0),
            mpn TEXT,
            product_name TEXT,
            brand TEXT,
            supplier_stock INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            moq INTEGER NOT NULL DEFAULT 1,
            lead_time TEXT,
            payment_terms TEXT,
            match_method TEXT NOT NULL CHECK (match_method IN ('ean', 'mpn', 'name', 'none')),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            CHECK ((product_id IS NULL) = (match_method = 'none'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS ux_supplier_products_matched
            ON supplier_products (supplier_id, product_id)
            WHERE product_id IS NOT NULL;

        CREATE INDEX IF NOT EXISTS ix_supplier_products_unmatched
            ON supplier_products (supplier_id, ean)
            WHERE product_id IS NULL;

        CREATE INDEX IF NOT EXISTS ix_import_jobs_status ON import_jobs (status);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('config_kv', 'import_jobs', 'products', 'suppliers', 'supplier_products')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_match_method_totality_enforced_by_schema() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        conn.execute("INSERT INTO suppliers (name) VALUES ('Acme')", []).unwrap();

        let bad = conn.execute(
            "INSERT INTO supplier_products (supplier_id, product_id, ean, match_method)
             VALUES (1, NULL, '111', 'ean')",
            [],
        );
        assert!(bad.is_err());

        conn.execute(
            "INSERT INTO supplier_products (supplier_id, product_id, ean, match_method)
             VALUES (1, NULL, '111', 'none')",
            [],
        )
        .unwrap();
    }
}
