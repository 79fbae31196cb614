// ==========================================
// 供应商目录导入系统 - 记录存储 Trait
// ==========================================
// 职责: 目录 / 供应商 / 供应商商品三张表的窄接口
// 红线: Repository 不含业务规则，匹配全部在内存完成，不做联表
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use serde_json::Value;

/// 行 = 列名 → JSON 值
pub type Row = serde_json::Map<String, Value>;

// ==========================================
// ColumnKind - 列存储类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Json, // 以 TEXT 存储，读出时还原为 JSON
}

// ==========================================
// Table - 白名单表
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Products,
    Suppliers,
    SupplierProducts,
}

const PRODUCT_COLUMNS: &[(&str, ColumnKind)] = &[
    ("id", ColumnKind::Integer),
    ("ean", ColumnKind::Text),
    ("title", ColumnKind::Text),
    ("mpn", ColumnKind::Text),
    ("custom_mpn", ColumnKind::Text),
    ("asin", ColumnKind::Text),
    ("upc", ColumnKind::Text),
    ("brand", ColumnKind::Text),
    ("category", ColumnKind::Text),
    ("sale_price", ColumnKind::Real),
    ("amazon_fee", ColumnKind::Real),
    ("fba_fees", ColumnKind::Real),
    ("referral_fee", ColumnKind::Real),
    ("buy_box_price", ColumnKind::Real),
    ("units_sold", ColumnKind::Integer),
    ("rating", ColumnKind::Real),
    ("review_count", ColumnKind::Integer),
    ("created_at", ColumnKind::Text),
    ("updated_at", ColumnKind::Text),
];

const SUPPLIER_COLUMNS: &[(&str, ColumnKind)] = &[
    ("id", ColumnKind::Integer),
    ("name", ColumnKind::Text),
    ("custom_attributes", ColumnKind::Json),
    ("created_at", ColumnKind::Text),
    ("updated_at", ColumnKind::Text),
];

const SUPPLIER_PRODUCT_COLUMNS: &[(&str, ColumnKind)] = &[
    ("id", ColumnKind::Integer),
    ("supplier_id", ColumnKind::Integer),
    ("product_id", ColumnKind::Integer),
    ("ean", ColumnKind::Text),
    ("mpn", ColumnKind::Text),
    ("product_name", ColumnKind::Text),
    ("brand", ColumnKind::Text),
    ("supplier_stock", ColumnKind::Integer),
    ("cost", ColumnKind::Real),
    ("moq", ColumnKind::Integer),
    ("lead_time", ColumnKind::Text),
    ("payment_terms", ColumnKind::Text),
    ("match_method", ColumnKind::Text),
    ("created_at", ColumnKind::Text),
    ("updated_at", ColumnKind::Text),
];

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Products => "products",
            Table::Suppliers => "suppliers",
            Table::SupplierProducts => "supplier_products",
        }
    }

    pub fn columns(&self) -> &'static [(&'static str, ColumnKind)] {
        match self {
            Table::Products => PRODUCT_COLUMNS,
            Table::Suppliers => SUPPLIER_COLUMNS,
            Table::SupplierProducts => SUPPLIER_PRODUCT_COLUMNS,
        }
    }

    pub fn column_kind(&self, column: &str) -> Option<ColumnKind> {
        self.columns()
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, kind)| *kind)
    }

    /// 校验列名在白名单内
    pub fn check_column(&self, column: &str) -> RepositoryResult<ColumnKind> {
        self.column_kind(column)
            .ok_or_else(|| RepositoryError::UnknownColumn {
                table: self.name().to_string(),
                column: column.to_string(),
            })
    }

    /// 冲突目标为部分唯一索引时需要的谓词
    pub fn conflict_predicate(&self, conflict_key: &[&str]) -> Option<&'static str> {
        match self {
            Table::SupplierProducts if conflict_key.contains(&"product_id") => {
                Some("product_id IS NOT NULL")
            }
            _ => None,
        }
    }

    /// upsert 时不可被覆盖的列
    pub fn is_immutable_on_update(column: &str) -> bool {
        matches!(column, "id" | "created_at")
    }
}

// ==========================================
// Filter - 查询 / 删除 / 更新条件
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn is_in<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull(column.to_string())
    }

    pub fn not_null(column: &str) -> Self {
        Filter::NotNull(column.to_string())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }
}

// ==========================================
// RecordStore Trait
// ==========================================
// 实现者: SqliteRecordStore（使用 rusqlite）
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 按冲突键 upsert（整批一个事务）
    ///
    /// # 返回
    /// - Ok(usize): 写入行数
    /// - Err: 整批回滚
    async fn upsert(
        &self,
        table: Table,
        rows: Vec<Row>,
        conflict_key: &[&str],
    ) -> RepositoryResult<usize>;

    /// 批量插入（整批一个事务）
    async fn insert(&self, table: Table, rows: Vec<Row>) -> RepositoryResult<usize>;

    /// 条件查询（按 id 升序）
    async fn query(&self, table: Table, filter: Filter) -> RepositoryResult<Vec<Row>>;

    /// 条件删除
    async fn delete(&self, table: Table, filter: Filter) -> RepositoryResult<usize>;

    /// 条件更新指定列
    async fn update(&self, table: Table, filter: Filter, fields: Row) -> RepositoryResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_whitelist() {
        assert_eq!(Table::Products.check_column("ean").unwrap(), ColumnKind::Text);
        assert!(matches!(
            Table::Suppliers.check_column("name; DROP TABLE suppliers"),
            Err(RepositoryError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_conflict_predicate_for_partial_index() {
        assert_eq!(
            Table::SupplierProducts.conflict_predicate(&["supplier_id", "product_id"]),
            Some("product_id IS NOT NULL")
        );
        assert_eq!(Table::Products.conflict_predicate(&["ean"]), None);
    }
}
