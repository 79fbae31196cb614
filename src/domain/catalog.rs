// ==========================================
// 供应商目录导入系统 - 目录商品领域模型
// ==========================================
// 职责: 目录商品快照（匹配用）/ 商品导入记录
// 对齐: products 表
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// CandidateProduct - 目录商品快照
// ==========================================
// 用途: 每个任务拉取一次，只读，用于身份匹配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateProduct {
    pub id: i64,
    #[serde(default)]
    pub ean: Option<String>,
    #[serde(default)]
    pub mpn: Option<String>,
    #[serde(default)]
    pub custom_mpn: Option<String>, // 自定义料号，与 mpn 一并建索引
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
}

impl CandidateProduct {
    /// 是否缺少 MPN（MPN 匹配成功后触发回填）
    pub fn lacks_mpn(&self) -> bool {
        self.mpn.as_deref().map(str::trim).unwrap_or("").is_empty()
    }
}

// ==========================================
// ProductRecord - 商品导入记录
// ==========================================
// 用途: 商品类导入任务，按 ean 幂等 upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    // ===== 主键 =====
    pub ean: String, // 真实或合成（GEN 前缀）

    // ===== 基础信息 =====
    pub title: String,
    pub mpn: Option<String>,
    pub asin: Option<String>,
    pub upc: Option<String>,
    pub brand: String,
    pub category: Option<String>,

    // ===== 价格与费用 =====
    pub sale_price: f64,
    pub amazon_fee: f64,
    pub fba_fees: f64,
    pub referral_fee: f64,
    pub buy_box_price: f64,

    // ===== 销量与评价 =====
    pub units_sold: i64,
    pub rating: Option<f64>,
    pub review_count: i64,

    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    pub ean_synthesized: bool,
    #[serde(skip)]
    pub row_number: u64,
}
