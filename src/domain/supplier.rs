// ==========================================
// 供应商目录导入系统 - 供应商领域模型
// ==========================================
// 职责: 供应商行 / 按供应商聚合 / 供应商商品关联
// 对齐: suppliers / supplier_products 表
// ==========================================

use crate::domain::types::MatchMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// 原始系统沿用的供应商行默认值
pub const DEFAULT_MOQ: i64 = 1;
pub const DEFAULT_LEAD_TIME: &str = "3 days";
pub const DEFAULT_PAYMENT_TERMS: &str = "Net 30";

// ==========================================
// MatchKeys - 各策略的匹配键
// ==========================================
// 默认取映射字段，可被 match_column_overrides 覆盖
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchKeys {
    pub ean: Option<String>,
    pub mpn: Option<String>,
    pub name: Option<String>,
}

// ==========================================
// SupplierLineItem - 供应商报价行（已投影）
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierLineItem {
    pub row_number: u64,
    pub supplier_name: String,
    pub product_name: Option<String>,
    pub brand: Option<String>,
    pub ean: String, // 真实或合成（SUP 前缀），永不为空
    pub ean_synthesized: bool,
    pub mpn: Option<String>,
    pub cost: f64,
    pub supplier_stock: i64,
    pub moq: i64,
    pub lead_time: String,
    pub payment_terms: String,
    pub custom_attributes: BTreeMap<String, String>,
    pub match_keys: MatchKeys,
}

// ==========================================
// SupplierGroup - 分块内按供应商聚合
// ==========================================
// 生命周期: 仅存在于单个分块的处理过程中
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierGroup {
    pub name: String,
    pub custom_attributes: BTreeMap<String, String>, // 取组内首行
    pub items: Vec<SupplierLineItem>,
}

impl SupplierGroup {
    /// 按供应商名称聚合（保持首次出现顺序，组内保持行顺序）
    pub fn group_items(items: Vec<SupplierLineItem>) -> Vec<SupplierGroup> {
        let mut groups: Vec<SupplierGroup> = Vec::new();
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();

        for item in items {
            match positions.get(&item.supplier_name) {
                Some(&idx) => groups[idx].items.push(item),
                None => {
                    positions.insert(item.supplier_name.clone(), groups.len());
                    groups.push(SupplierGroup {
                        name: item.supplier_name.clone(),
                        custom_attributes: item.custom_attributes.clone(),
                        items: vec![item],
                    });
                }
            }
        }

        groups
    }
}

// ==========================================
// SupplierRecord - 供应商（suppliers 表）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierRecord {
    pub name: String,
    pub custom_attributes: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

// ==========================================
// SupplierProductLink - 供应商商品关联
// ==========================================
// 红线: match_method 必填；product_id 为空 ⇔ match_method = none
// 已匹配行按 (supplier_id, product_id) upsert
// 未匹配行按 (supplier_id, ean 集合) 先删后插
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierProductLink {
    pub supplier_id: i64,
    pub product_id: Option<i64>,
    pub ean: String,
    pub mpn: Option<String>,
    pub product_name: Option<String>,
    pub brand: Option<String>,
    pub supplier_stock: i64,
    pub cost: f64,
    pub moq: i64,
    pub lead_time: String,
    pub payment_terms: String,
    pub match_method: MatchMethod,
    pub updated_at: DateTime<Utc>,
}

impl SupplierProductLink {
    /// 由报价行与匹配结果构造关联
    ///
    /// product_id 与 match_method 不一致时以 product_id 为准修正
    pub fn from_item(
        supplier_id: i64,
        item: &SupplierLineItem,
        product_id: Option<i64>,
        match_method: MatchMethod,
    ) -> Self {
        let match_method = match (product_id, match_method) {
            (None, _) => MatchMethod::None,
            (Some(_), MatchMethod::None) => MatchMethod::None,
            (Some(_), method) => method,
        };
        let product_id = if match_method.is_matched() { product_id } else { None };

        Self {
            supplier_id,
            product_id,
            ean: item.ean.clone(),
            mpn: item.mpn.clone(),
            product_name: item.product_name.clone(),
            brand: item.brand.clone(),
            supplier_stock: item.supplier_stock,
            cost: item.cost,
            moq: item.moq,
            lead_time: item.lead_time.clone(),
            payment_terms: item.payment_terms.clone(),
            match_method,
            updated_at: Utc::now(),
        }
    }

    pub fn is_matched(&self) -> bool {
        self.product_id.is_some()
    }
}
