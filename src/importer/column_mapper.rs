// ==========================================
// 供应商目录导入系统 - 列自动映射器
// ==========================================
// 职责: 将任意 CSV 表头映射到标准字段
// 流程: 显式映射 → 精确同义词匹配 → 子串匹配
// 红线: 结果只依赖表头顺序，同一表头不被两个自动匹配字段占用
// ==========================================

use crate::domain::types::JobKind;
use crate::importer::identifier::normalize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// 自定义属性字段名前缀
pub const CUSTOM_FIELD_PREFIX: &str = "custom:";

// ==========================================
// FieldType - 标准字段类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Price, // 允许货币符号 / 千分位，0 为合法值
}

// ==========================================
// CanonicalField - 标准字段定义
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalField {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub synonyms: Vec<String>,
}

impl CanonicalField {
    fn new(name: &str, field_type: FieldType, synonyms: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
            synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// 自定义属性字段：唯一同义词为属性名本身
    pub fn custom(attribute: &str) -> Self {
        Self {
            name: format!("{}{}", CUSTOM_FIELD_PREFIX, attribute),
            field_type: FieldType::Text,
            required: false,
            synonyms: vec![attribute.to_string()],
        }
    }

    pub fn is_custom(&self) -> bool {
        self.name.starts_with(CUSTOM_FIELD_PREFIX)
    }

    /// 自定义属性名（非自定义字段返回 None）
    pub fn custom_attribute(&self) -> Option<&str> {
        self.name.strip_prefix(CUSTOM_FIELD_PREFIX)
    }

    fn normalized_synonyms(&self) -> impl Iterator<Item = String> + '_ {
        self.synonyms
            .iter()
            .map(|s| normalize(s))
            .filter(|s| !s.is_empty())
    }
}

// ==========================================
// FieldDictionary - 标准字段字典
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDictionary {
    pub kind: JobKind,
    fields: Vec<CanonicalField>,
}

impl FieldDictionary {
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Supplier => Self::supplier(),
            JobKind::Product => Self::product(),
        }
    }

    /// 供应商报价字段
    pub fn supplier() -> Self {
        use FieldType::*;
        Self {
            kind: JobKind::Supplier,
            fields: vec![
                CanonicalField::new(
                    "supplier_name",
                    Text,
                    &["supplier_name", "supplier", "vendor_name", "vendor"],
                )
                .required(),
                CanonicalField::new(
                    "product_name",
                    Text,
                    &["product_name", "product", "title", "item_name", "description", "name"],
                ),
                CanonicalField::new("brand", Text, &["brand", "manufacturer", "make"]),
                CanonicalField::new("ean", Text, &["ean", "barcode", "ean13", "gtin", "upc"]),
                CanonicalField::new(
                    "mpn",
                    Text,
                    &["mpn", "manufacturer_part_number", "part_number", "sku", "model"],
                ),
                CanonicalField::new(
                    "cost",
                    Price,
                    &["cost", "supplier_cost", "unit_cost", "price", "unit_price"],
                ),
                CanonicalField::new(
                    "supplier_stock",
                    Integer,
                    &["supplier_stock", "stock", "quantity", "qty", "inventory"],
                ),
                CanonicalField::new(
                    "moq",
                    Integer,
                    &["moq", "minimum_order_quantity", "min_order"],
                ),
                CanonicalField::new("lead_time", Text, &["lead_time", "delivery_time"]),
                CanonicalField::new("payment_terms", Text, &["payment_terms", "terms"]),
            ],
        }
    }

    /// 目录商品字段
    pub fn product() -> Self {
        use FieldType::*;
        Self {
            kind: JobKind::Product,
            fields: vec![
                CanonicalField::new(
                    "title",
                    Text,
                    &["title", "product_name", "product_title", "name", "product"],
                )
                .required(),
                CanonicalField::new("ean", Text, &["ean", "barcode", "ean13", "gtin"]),
                CanonicalField::new(
                    "mpn",
                    Text,
                    &["mpn", "manufacturer_part_number", "part_number", "model"],
                ),
                CanonicalField::new("brand", Text, &["brand", "manufacturer"]),
                CanonicalField::new(
                    "sale_price",
                    Price,
                    &["sale_price", "price", "selling_price", "retail_price"],
                ),
                CanonicalField::new("asin", Text, &["asin"]),
                CanonicalField::new("upc", Text, &["upc"]),
                CanonicalField::new(
                    "units_sold",
                    Integer,
                    &["units_sold", "monthly_sales", "sales", "sold"],
                ),
                CanonicalField::new("amazon_fee", Price, &["amazon_fee", "amazon_fees"]),
                CanonicalField::new("fba_fees", Price, &["fba_fees", "fba_fee", "fba"]),
                CanonicalField::new(
                    "referral_fee",
                    Price,
                    &["referral_fee", "referral_fees", "referral"],
                ),
                CanonicalField::new(
                    "buy_box_price",
                    Price,
                    &["buy_box_price", "buy_box", "buybox"],
                ),
                CanonicalField::new("category", Text, &["category", "product_category"]),
                CanonicalField::new("rating", Decimal, &["rating", "average_rating", "stars"]),
                CanonicalField::new(
                    "review_count",
                    Integer,
                    &["review_count", "reviews", "number_of_reviews", "ratings_count"],
                ),
            ],
        }
    }

    /// 追加自定义属性字段（重复或与标准字段同名的忽略）
    pub fn with_custom_attributes<'a, I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        for attribute in attributes {
            let attribute = attribute.trim();
            if attribute.is_empty() {
                continue;
            }
            let field = CanonicalField::custom(attribute);
            if self.get(&field.name).is_none() {
                self.fields.push(field);
            }
        }
        self
    }

    pub fn fields(&self) -> &[CanonicalField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&CanonicalField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> Vec<&CanonicalField> {
        self.fields.iter().filter(|f| f.required).collect()
    }

    /// 将前端标签 / 字段名翻译为标准字段名
    ///
    /// 例: "Supplier Name" → supplier_name，"Supplier Cost" → cost
    pub fn resolve_label(&self, label: &str) -> Option<&CanonicalField> {
        let trimmed = label.trim();
        if let Some(field) = self.get(trimmed) {
            return Some(field);
        }

        let key = normalize(trimmed);
        if key.is_empty() {
            return None;
        }

        self.fields
            .iter()
            .find(|f| !f.is_custom() && normalize(&f.name) == key)
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|f| f.normalized_synonyms().any(|s| s == key))
            })
    }
}

// ==========================================
// ColumnMapping - 标准字段 → 列下标
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: BTreeMap<String, usize>,
}

impl ColumnMapping {
    pub fn get(&self, field: &str) -> Option<usize> {
        self.columns.get(field).copied()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.columns.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, column: usize) {
        self.columns.insert(field.into(), column);
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// 未映射的必填字段
    pub fn missing_required(&self, dictionary: &FieldDictionary) -> Vec<String> {
        dictionary
            .required_fields()
            .into_iter()
            .filter(|f| !self.contains(&f.name))
            .map(|f| f.name.clone())
            .collect()
    }
}

/// 按表头文本查找列（去空白、忽略大小写）
pub fn find_header(headers: &[String], wanted: &str) -> Option<usize> {
    let wanted = wanted.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    headers
        .iter()
        .position(|h| h.trim().to_lowercase() == wanted)
}

// ==========================================
// ColumnMapper - 列自动映射
// ==========================================
pub struct ColumnMapper;

impl ColumnMapper {
    /// 解析表头映射
    ///
    /// # 参数
    /// - headers: 源文件表头（保持原顺序）
    /// - dictionary: 标准字段字典（含自定义属性）
    /// - explicit: 任务显式映射（标准字段或前端标签 → 源表头），优先生效
    ///
    /// # 返回
    /// - ColumnMapping: 未匹配的字段不出现
    pub fn resolve(
        headers: &[String],
        dictionary: &FieldDictionary,
        explicit: &BTreeMap<String, String>,
    ) -> ColumnMapping {
        let mut mapping = ColumnMapping::default();
        let mut claimed: HashSet<usize> = HashSet::new();

        // === 显式映射 ===
        for (label, header) in explicit {
            if header.trim().is_empty() {
                continue;
            }
            let Some(field) = dictionary.resolve_label(label) else {
                warn!(label = %label, "显式映射的字段未知，已忽略");
                continue;
            };
            match find_header(headers, header) {
                Some(idx) => {
                    if !mapping.contains(&field.name) {
                        debug!(field = %field.name, header = %headers[idx], "显式映射");
                        mapping.insert(field.name.clone(), idx);
                        claimed.insert(idx);
                    }
                }
                None => {
                    warn!(field = %field.name, header = %header, "显式映射的表头不存在，回退到自动匹配");
                }
            }
        }

        let normalized_headers: Vec<String> = headers.iter().map(|h| normalize(h)).collect();

        // === 第一轮: 精确匹配 ===
        for field in dictionary.fields() {
            if mapping.contains(&field.name) {
                continue;
            }
            let hit = field.normalized_synonyms().find_map(|synonym| {
                normalized_headers
                    .iter()
                    .enumerate()
                    .find(|(idx, h)| !claimed.contains(idx) && **h == synonym)
                    .map(|(idx, _)| idx)
            });
            if let Some(idx) = hit {
                debug!(field = %field.name, header = %headers[idx], "精确匹配");
                mapping.insert(field.name.clone(), idx);
                claimed.insert(idx);
            }
        }

        // === 第二轮: 子串匹配 ===
        for field in dictionary.fields() {
            if mapping.contains(&field.name) {
                continue;
            }
            let hit = field.normalized_synonyms().find_map(|synonym| {
                normalized_headers
                    .iter()
                    .enumerate()
                    .find(|(idx, h)| !claimed.contains(idx) && h.contains(synonym.as_str()))
                    .map(|(idx, _)| idx)
            });
            if let Some(idx) = hit {
                debug!(field = %field.name, header = %headers[idx], "子串匹配");
                mapping.insert(field.name.clone(), idx);
                claimed.insert(idx);
            }
        }

        info!(
            mapped = mapping.len(),
            headers = headers.len(),
            "表头映射完成"
        );
        mapping
    }
}
