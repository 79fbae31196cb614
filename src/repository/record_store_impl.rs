// ==========================================
// 供应商目录导入系统 - 记录存储 SQLite 实现
// ==========================================
// 职责: RecordStore 的 rusqlite 实现
// 约束: 所有值参数化绑定，列名走白名单
// 并发: Arc<Mutex<Connection>> + spawn_blocking（外层超时可生效）
// ==========================================

use crate::db::open_sqlite_connection;
use crate::perf::{install_sqlite_tracing, PerfGuard};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::record_store::{ColumnKind, Filter, RecordStore, Row, Table};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::sync::{Arc, Mutex};

// ==========================================
// SqliteRecordStore
// ==========================================
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// 创建新的 Repository 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let mut conn = open_sqlite_connection(db_path)
            .map_err(|e| RepositoryError::DatabaseConnectionError(e.to_string()))?;
        install_sqlite_tracing(&mut conn);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从共享连接创建
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 在阻塞线程上持锁执行
    async fn with_conn<T, F>(&self, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> RepositoryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| RepositoryError::LockError(format!("锁获取失败: {}", e)))?;
            f(&mut guard)
        })
        .await?
    }
}

// ==========================================
// 值转换
// ==========================================

fn json_to_sql(kind: ColumnKind, value: &Value) -> RepositoryResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if kind == ColumnKind::Json {
        return Ok(SqlValue::Text(serde_json::to_string(value)?));
    }

    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) if kind == ColumnKind::Integer && f.fract() == 0.0 => {
                SqlValue::Integer(f as i64)
            }
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => SqlValue::Null,
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    })
}

fn sql_to_json(kind: ColumnKind, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if kind == ColumnKind::Json {
                serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
            } else {
                Value::String(text.into_owned())
            }
        }
        ValueRef::Blob(_) => Value::Null,
    }
}

/// 渲染过滤条件（参数按出现顺序追加）
fn render_filter(table: Table, filter: &Filter, params: &mut Vec<SqlValue>) -> RepositoryResult<String> {
    Ok(match filter {
        Filter::All => "1".to_string(),
        Filter::Eq(column, value) => {
            let kind = table.check_column(column)?;
            if value.is_null() {
                format!("{} IS NULL", column)
            } else {
                params.push(json_to_sql(kind, value)?);
                format!("{} = ?", column)
            }
        }
        Filter::In(column, values) => {
            let kind = table.check_column(column)?;
            if values.is_empty() {
                "0".to_string()
            } else {
                for value in values {
                    params.push(json_to_sql(kind, value)?);
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", column, placeholders)
            }
        }
        Filter::IsNull(column) => {
            table.check_column(column)?;
            format!("{} IS NULL", column)
        }
        Filter::NotNull(column) => {
            table.check_column(column)?;
            format!("{} IS NOT NULL", column)
        }
        Filter::And(filters) => {
            if filters.is_empty() {
                "1".to_string()
            } else {
                let parts = filters
                    .iter()
                    .map(|f| render_filter(table, f, params).map(|sql| format!("({})", sql)))
                    .collect::<RepositoryResult<Vec<_>>>()?;
                parts.join(" AND ")
            }
        }
    })
}

/// 行 → (列名列表, 绑定值)
fn bind_row(table: Table, row: &Row) -> RepositoryResult<(Vec<String>, Vec<SqlValue>)> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (column, value) in row {
        let kind = table.check_column(column)?;
        columns.push(column.clone());
        values.push(json_to_sql(kind, value)?);
    }
    if columns.is_empty() {
        return Err(RepositoryError::ValidationError(format!(
            "{}: 空行不可写入",
            table.name()
        )));
    }
    Ok((columns, values))
}

fn insert_sql(table: Table, columns: &[String]) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    )
}

fn upsert_sql(table: Table, columns: &[String], conflict_key: &[&str]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_key.contains(&c.as_str()) && !Table::is_immutable_on_update(c))
        .map(|c| format!("{0} = excluded.{0}", c))
        .collect();

    let target = match table.conflict_predicate(conflict_key) {
        Some(predicate) => format!("({}) WHERE {}", conflict_key.join(", "), predicate),
        None => format!("({})", conflict_key.join(", ")),
    };

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!("{} ON CONFLICT{} {}", insert_sql(table, columns), target, action)
}

fn select_columns(table: Table) -> String {
    table
        .columns()
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Row>,
        conflict_key: &[&str],
    ) -> RepositoryResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        for key in conflict_key {
            table.check_column(key)?;
        }
        if conflict_key.is_empty() {
            return Err(RepositoryError::ValidationError("upsert 缺少冲突键".to_string()));
        }
        let conflict_key: Vec<String> = conflict_key.iter().map(|k| k.to_string()).collect();

        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("record_store.upsert").table(table.name());
            let key_refs: Vec<&str> = conflict_key.iter().map(String::as_str).collect();
            let tx = conn.transaction()?;
            let mut count = 0;
            for row in &rows {
                let (columns, values) = bind_row(table, row)?;
                let sql = upsert_sql(table, &columns, &key_refs);
                let mut stmt = tx.prepare_cached(&sql)?;
                count += stmt.execute(params_from_iter(values))?;
            }
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> RepositoryResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("record_store.insert").table(table.name());
            let tx = conn.transaction()?;
            let mut count = 0;
            for row in &rows {
                let (columns, values) = bind_row(table, row)?;
                let mut stmt = tx.prepare_cached(&insert_sql(table, &columns))?;
                count += stmt.execute(params_from_iter(values))?;
            }
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    async fn query(&self, table: Table, filter: Filter) -> RepositoryResult<Vec<Row>> {
        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("record_store.query").table(table.name());
            let mut params = Vec::new();
            let predicate = render_filter(table, &filter, &mut params)?;
            let sql = format!(
                "SELECT {} FROM {} WHERE {} ORDER BY id",
                select_columns(table),
                table.name(),
                predicate
            );

            let columns = table.columns();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (idx, (name, kind)) in columns.iter().enumerate() {
                    record.insert(name.to_string(), sql_to_json(*kind, row.get_ref(idx)?));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await
    }

    async fn delete(&self, table: Table, filter: Filter) -> RepositoryResult<usize> {
        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("record_store.delete").table(table.name());
            let mut params = Vec::new();
            let predicate = render_filter(table, &filter, &mut params)?;
            let sql = format!("DELETE FROM {} WHERE {}", table.name(), predicate);
            Ok(conn.execute(&sql, params_from_iter(params))?)
        })
        .await
    }

    async fn update(&self, table: Table, filter: Filter, fields: Row) -> RepositoryResult<usize> {
        if fields.is_empty() {
            return Ok(0);
        }

        self.with_conn(move |conn| {
            let _perf = PerfGuard::new("record_store.update").table(table.name());
            let (columns, mut params) = bind_row(table, &fields)?;
            if let Some(column) = columns.iter().find(|c| Table::is_immutable_on_update(c)) {
                return Err(RepositoryError::FieldValueError {
                    field: column.clone(),
                    message: "该列不可更新".to_string(),
                });
            }
            let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
            let predicate = render_filter(table, &filter, &mut params)?;
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                table.name(),
                assignments.join(", "),
                predicate
            );
            Ok(conn.execute(&sql, params_from_iter(params))?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, SqliteRecordStore) {
        let file = NamedTempFile::new().unwrap();
        let conn = open_sqlite_connection(file.path().to_str().unwrap()).unwrap();
        init_schema(&conn).unwrap();
        (file, SqliteRecordStore::from_connection(Arc::new(Mutex::new(conn))))
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_upsert_sql_for_partial_index() {
        let columns = vec!["ean".to_string(), "product_id".to_string(), "supplier_id".to_string()];
        let sql = upsert_sql(Table::SupplierProducts, &columns, &["supplier_id", "product_id"]);
        assert!(sql.contains("ON CONFLICT(supplier_id, product_id) WHERE product_id IS NOT NULL"));
        assert!(sql.contains("ean = excluded.ean"));
        assert!(!sql.contains("supplier_id = excluded"));
    }

    #[tokio::test]
    async fn test_upsert_keeps_id_and_updates_fields() {
        let (_file, store) = store();
        store
            .upsert(Table::Suppliers, vec![row(json!({"name": "Acme", "custom_attributes": {"tier": "gold"}}))], &["name"])
            .await
            .unwrap();
        let first = store.query(Table::Suppliers, Filter::eq("name", "Acme")).await.unwrap();
        let id = first[0]["id"].clone();
        assert_eq!(first[0]["custom_attributes"], json!({"tier": "gold"}));

        store
            .upsert(Table::Suppliers, vec![row(json!({"name": "Acme", "custom_attributes": {"tier": "silver"}}))], &["name"])
            .await
            .unwrap();
        let second = store.query(Table::Suppliers, Filter::All).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["id"], id);
        assert_eq!(second[0]["custom_attributes"], json!({"tier": "silver"}));
    }

    #[tokio::test]
    async fn test_filters_delete_and_update() {
        let (_file, store) = store();
        store
            .insert(
                Table::Products,
                vec![
                    row(json!({"ean": "111", "title": "A"})),
                    row(json!({"ean": "222", "title": "B", "mpn": "X-1"})),
                    row(json!({"ean": "333", "title": "C"})),
                ],
            )
            .await
            .unwrap();

        let no_mpn = store.query(Table::Products, Filter::is_null("mpn")).await.unwrap();
        assert_eq!(no_mpn.len(), 2);

        let updated = store
            .update(Table::Products, Filter::eq("ean", "111"), row(json!({"mpn": "Z-9"})))
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let removed = store
            .delete(Table::Products, Filter::and(vec![Filter::is_in("ean", ["111", "333"]), Filter::not_null("mpn")]))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let rest = store.query(Table::Products, Filter::All).await.unwrap();
        let eans: Vec<&str> = rest.iter().filter_map(|r| r["ean"].as_str()).collect();
        assert_eq!(eans, vec!["222", "333"]);

        let none = store
            .query(Table::Products, Filter::is_in("ean", Vec::<String>::new()))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_column_rejected() {
        let (_file, store) = store();
        let err = store
            .insert(Table::Products, vec![row(json!({"ean": "1", "bogus": 1}))])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let (_file, store) = store();
        let result = store
            .insert(
                Table::Products,
                vec![row(json!({"ean": "dup", "title": "A"})), row(json!({"ean": "dup", "title": "B"}))],
            )
            .await;
        assert!(matches!(result, Err(RepositoryError::UniqueConstraintViolation(_))));
        let rows = store.query(Table::Products, Filter::All).await.unwrap();
        assert!(rows.is_empty());
    }
}
