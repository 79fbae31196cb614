// ==========================================
// 供应商目录导入系统 - 行校验与投影
// ==========================================
// 职责: 原始行 + 表头映射 → 带类型的候选记录
// 红线: 跳过行只计数，不报错
// ==========================================

use crate::domain::catalog::ProductRecord;
use crate::domain::supplier::{
    MatchKeys, SupplierLineItem, DEFAULT_LEAD_TIME, DEFAULT_MOQ, DEFAULT_PAYMENT_TERMS,
};
use crate::domain::types::{JobKind, MatchStrategy};
use crate::importer::chunk_stream::RawRow;
use crate::importer::column_mapper::{ColumnMapping, FieldDictionary, FieldType};
use crate::importer::identifier::{
    clean_ean, synthesize_identifier, PRODUCT_ID_PREFIX, SUPPLIER_ID_PREFIX,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// 商品缺少品牌时的默认值
pub const DEFAULT_BRAND: &str = "Unknown Brand";

// ==========================================
// 投影结果
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateRecord {
    Supplier(SupplierLineItem),
    Product(ProductRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingRequired { field: String },
    EmptyRow,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingRequired { field } => write!(f, "必填字段为空: {}", field),
            SkipReason::EmptyRow => f.write_str("空行"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projected {
    Record(CandidateRecord),
    Skip(SkipReason),
}

// ==========================================
// 数值解析
// ==========================================

/// 解析价格（容忍货币符号、千分位、空白）
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '$' | '£' | '€' | ','))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// 解析整数（容忍千分位与 "12.0" 样式）
pub fn parse_integer(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(v) = cleaned.parse::<i64>() {
        return Some(v);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i64)
}

// ==========================================
// RowProjector - 行投影器
// ==========================================
pub struct RowProjector {
    kind: JobKind,
    dictionary: FieldDictionary,
    mapping: ColumnMapping,
    override_columns: BTreeMap<MatchStrategy, usize>,
    job_timestamp: DateTime<Utc>,
}

impl RowProjector {
    /// 创建行投影器
    ///
    /// # 参数
    /// - dictionary: 标准字段字典（决定必填字段与类型）
    /// - mapping: 表头映射
    /// - override_columns: 匹配策略 → 匹配键所在列
    /// - job_timestamp: 任务时间戳（合成标识符使用）
    pub fn new(
        dictionary: FieldDictionary,
        mapping: ColumnMapping,
        override_columns: BTreeMap<MatchStrategy, usize>,
        job_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: dictionary.kind,
            dictionary,
            mapping,
            override_columns,
            job_timestamp,
        }
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    /// 投影一行
    pub fn project(&self, row: &RawRow) -> Projected {
        if row.fields.iter().all(|f| f.trim().is_empty()) {
            return Projected::Skip(SkipReason::EmptyRow);
        }

        for field in self.dictionary.required_fields() {
            if field.field_type == FieldType::Price {
                continue;
            }
            if self.text(row, &field.name).is_none() {
                return Projected::Skip(SkipReason::MissingRequired {
                    field: field.name.clone(),
                });
            }
        }

        match self.kind {
            JobKind::Supplier => Projected::Record(CandidateRecord::Supplier(self.project_supplier(row))),
            JobKind::Product => Projected::Record(CandidateRecord::Product(self.project_product(row))),
        }
    }

    fn column_text<'r>(row: &'r RawRow, idx: usize) -> Option<&'r str> {
        row.fields
            .get(idx)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    fn text<'r>(&self, row: &'r RawRow, field: &str) -> Option<&'r str> {
        self.mapping
            .get(field)
            .and_then(|idx| Self::column_text(row, idx))
    }

    fn owned_text(&self, row: &RawRow, field: &str) -> Option<String> {
        self.text(row, field).map(str::to_string)
    }

    fn price(&self, row: &RawRow, field: &str) -> f64 {
        match self.text(row, field) {
            None => 0.0,
            Some(raw) => parse_price(raw).unwrap_or_else(|| {
                debug!(row = row.row_number, field, value = raw, "数值无法解析，使用默认值 0");
                0.0
            }),
        }
    }

    fn integer_or(&self, row: &RawRow, field: &str, default: i64) -> i64 {
        match self.text(row, field) {
            None => default,
            Some(raw) => parse_integer(raw).unwrap_or_else(|| {
                debug!(row = row.row_number, field, value = raw, default, "整数无法解析，使用默认值");
                default
            }),
        }
    }

    fn decimal_opt(&self, row: &RawRow, field: &str) -> Option<f64> {
        let raw = self.text(row, field)?;
        let parsed = parse_price(raw);
        if parsed.is_none() {
            debug!(row = row.row_number, field, value = raw, "小数无法解析，置空");
        }
        parsed
    }

    fn ean(&self, row: &RawRow) -> Option<String> {
        self.text(row, "ean")
            .map(clean_ean)
            .filter(|e| !e.is_empty())
    }

    fn override_text(&self, row: &RawRow, strategy: MatchStrategy) -> Option<Option<String>> {
        self.override_columns
            .get(&strategy)
            .map(|idx| Self::column_text(row, *idx).map(str::to_string))
    }

    fn custom_attributes(&self, row: &RawRow) -> BTreeMap<String, String> {
        self.dictionary
            .fields()
            .iter()
            .filter_map(|field| {
                let attribute = field.custom_attribute()?;
                let value = self.text(row, &field.name)?;
                Some((attribute.to_string(), value.to_string()))
            })
            .collect()
    }

    fn project_supplier(&self, row: &RawRow) -> SupplierLineItem {
        let supplier_name = self.owned_text(row, "supplier_name").unwrap_or_default();
        let product_name = self.owned_text(row, "product_name");
        let mpn = self.owned_text(row, "mpn");

        let real_ean = self.ean(row);
        let ean_synthesized = real_ean.is_none();
        let ean = real_ean.clone().unwrap_or_else(|| {
            // 不带时间戳: 重复导入得到同一 ean
            let label = product_name.as_deref().or(mpn.as_deref()).unwrap_or("");
            synthesize_identifier(SUPPLIER_ID_PREFIX, &[&supplier_name, label], row.row_number, None)
        });

        let match_keys = MatchKeys {
            ean: match self.override_text(row, MatchStrategy::Ean) {
                Some(v) => v.map(|e| clean_ean(&e)).filter(|e| !e.is_empty()),
                None => real_ean,
            },
            mpn: self
                .override_text(row, MatchStrategy::Mpn)
                .unwrap_or_else(|| mpn.clone()),
            name: self
                .override_text(row, MatchStrategy::Name)
                .unwrap_or_else(|| product_name.clone()),
        };

        SupplierLineItem {
            row_number: row.row_number,
            supplier_name,
            product_name,
            brand: self.owned_text(row, "brand"),
            ean,
            ean_synthesized,
            mpn,
            cost: self.price(row, "cost"),
            supplier_stock: self.integer_or(row, "supplier_stock", 0),
            moq: self.integer_or(row, "moq", DEFAULT_MOQ),
            lead_time: self
                .owned_text(row, "lead_time")
                .unwrap_or_else(|| DEFAULT_LEAD_TIME.to_string()),
            payment_terms: self
                .owned_text(row, "payment_terms")
                .unwrap_or_else(|| DEFAULT_PAYMENT_TERMS.to_string()),
            custom_attributes: self.custom_attributes(row),
            match_keys,
        }
    }

    fn project_product(&self, row: &RawRow) -> ProductRecord {
        let title = self.owned_text(row, "title").unwrap_or_default();
        let brand = self
            .owned_text(row, "brand")
            .unwrap_or_else(|| DEFAULT_BRAND.to_string());

        let real_ean = self.ean(row);
        let ean_synthesized = real_ean.is_none();
        let ean = real_ean.unwrap_or_else(|| {
            synthesize_identifier(
                PRODUCT_ID_PREFIX,
                &[&brand, &title],
                row.row_number,
                Some(self.job_timestamp),
            )
        });

        ProductRecord {
            ean,
            title,
            mpn: self.owned_text(row, "mpn"),
            asin: self.owned_text(row, "asin"),
            upc: self.text(row, "upc").map(clean_ean).filter(|u| !u.is_empty()),
            brand,
            category: self.owned_text(row, "category"),
            sale_price: self.price(row, "sale_price"),
            amazon_fee: self.price(row, "amazon_fee"),
            fba_fees: self.price(row, "fba_fees"),
            referral_fee: self.price(row, "referral_fee"),
            buy_box_price: self.price(row, "buy_box_price"),
            units_sold: self.integer_or(row, "units_sold", 0),
            rating: self.decimal_opt(row, "rating"),
            review_count: self.integer_or(row, "review_count", 0),
            updated_at: Utc::now(),
            ean_synthesized,
            row_number: row.row_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::column_mapper::ColumnMapper;
    use crate::importer::identifier::SYNTHETIC_ID_MAX_LEN;

    fn row(row_number: u64, fields: &[&str]) -> RawRow {
        RawRow {
            row_number,
            fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn projector(kind: JobKind, headers: &[&str]) -> RowProjector {
        let headers: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
        let dictionary = FieldDictionary::for_kind(kind).with_custom_attributes(["Warehouse"]);
        let mapping = ColumnMapper::resolve(&headers, &dictionary, &BTreeMap::new());
        RowProjector::new(dictionary, mapping, BTreeMap::new(), Utc::now())
    }

    #[test]
    fn test_parse_price_accepts_symbols_and_separators() {
        assert_eq!(parse_price(" $1,234.50 "), Some(1234.5));
        assert_eq!(parse_price("£7"), Some(7.0));
        assert_eq!(parse_price("€ 0"), Some(0.0));
        assert_eq!(parse_price("abc"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("1,200"), Some(1200));
        assert_eq!(parse_integer("12.0"), Some(12));
        assert_eq!(parse_integer("n/a"), None);
    }

    #[test]
    fn test_supplier_row_defaults_and_coercion() {
        let p = projector(JobKind::Supplier, &["Supplier", "EAN", "Cost", "Warehouse"]);
        let Projected::Record(CandidateRecord::Supplier(item)) =
            p.project(&row(1, &["Acme", "111", "oops", "North"]))
        else {
            panic!("expected supplier record");
        };
        assert_eq!(item.supplier_name, "Acme");
        assert_eq!(item.ean, "111");
        assert!(!item.ean_synthesized);
        assert_eq!(item.cost, 0.0);
        assert_eq!(item.moq, 1);
        assert_eq!(item.lead_time, "3 days");
        assert_eq!(item.payment_terms, "Net 30");
        assert_eq!(item.custom_attributes.get("Warehouse").map(String::as_str), Some("North"));
        assert_eq!(item.match_keys.ean.as_deref(), Some("111"));
    }

    #[test]
    fn test_missing_required_is_skipped() {
        let p = projector(JobKind::Supplier, &["Supplier", "EAN"]);
        assert_eq!(
            p.project(&row(3, &["  ", "111"])),
            Projected::Skip(SkipReason::MissingRequired {
                field: "supplier_name".to_string()
            })
        );
        assert_eq!(p.project(&row(4, &["", ""])), Projected::Skip(SkipReason::EmptyRow));
    }

    #[test]
    fn test_supplier_missing_ean_is_synthesized() {
        let p = projector(JobKind::Supplier, &["Supplier", "Product Name", "EAN"]);
        let Projected::Record(CandidateRecord::Supplier(item)) =
            p.project(&row(7, &["Acme Corp", "Blue Widget", ""]))
        else {
            panic!("expected supplier record");
        };
        assert_eq!(item.ean, "SUPACMEBLUE7");
        assert!(item.ean_synthesized);
        assert!(item.ean.len() <= SYNTHETIC_ID_MAX_LEN);
        // 合成 EAN 不参与匹配
        assert!(item.match_keys.ean.is_none());
        assert_eq!(item.match_keys.name.as_deref(), Some("Blue Widget"));
    }

    #[test]
    fn test_product_row_repairs_scientific_ean_and_defaults_brand() {
        let p = projector(JobKind::Product, &["Title", "EAN", "Price", "Rating"]);
        let Projected::Record(CandidateRecord::Product(product)) =
            p.project(&row(2, &["Drill", "8.40E+11", "$19.99", "x"]))
        else {
            panic!("expected product record");
        };
        assert_eq!(product.ean, "840000000000");
        assert_eq!(product.brand, DEFAULT_BRAND);
        assert_eq!(product.sale_price, 19.99);
        assert_eq!(product.rating, None);
    }

    #[test]
    fn test_match_column_override() {
        let headers: Vec<String> = ["Supplier", "MPN", "Alt Part"].iter().map(|s| s.to_string()).collect();
        let dictionary = FieldDictionary::supplier();
        let mapping = ColumnMapper::resolve(&headers, &dictionary, &BTreeMap::new());
        let mut overrides = BTreeMap::new();
        overrides.insert(MatchStrategy::Mpn, 2);
        let p = RowProjector::new(dictionary, mapping, overrides, Utc::now());

        let Projected::Record(CandidateRecord::Supplier(item)) = p.project(&row(1, &["Acme", "X-1", "ALT-9"]))
        else {
            panic!("expected supplier record");
        };
        assert_eq!(item.mpn.as_deref(), Some("X-1"));
        assert_eq!(item.match_keys.mpn.as_deref(), Some("ALT-9"));
    }
}
