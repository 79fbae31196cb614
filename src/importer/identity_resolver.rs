// ==========================================
// 供应商目录导入系统 - 身份匹配
// ==========================================
// 职责: 供应商报价行 → 目录商品（按优先级的多策略匹配）
// 策略: ean 精确 / mpn 精确→去前导零→子串 / name 精确→子串
// 红线: 首个命中即采用（按目录拉取顺序），非最优匹配
// ==========================================

use crate::domain::catalog::CandidateProduct;
use crate::domain::job::{MatchOptions, MatchStats};
use crate::domain::supplier::{SupplierGroup, SupplierLineItem};
use crate::domain::types::{MatchMethod, MatchStrategy};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::identifier::{clean_ean, is_synthetic, normalize, strip_leading_zeros};
use crate::repository::record_store::{Filter, RecordStore, Row, Table};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// MPN 子串匹配要求的最短规范化长度
pub const MIN_FUZZY_MPN_LEN: usize = 4;

// ==========================================
// CandidateIndex - 目录索引
// ==========================================
// 每个任务构建一次，之后只读
#[derive(Debug, Default)]
pub struct CandidateIndex {
    products: Vec<CandidateProduct>,
    by_ean: HashMap<String, usize>,
    by_mpn: HashMap<String, usize>,
    by_mpn_stripped: HashMap<String, usize>,
    by_title: HashMap<String, usize>,
    mpn_entries: Vec<(String, usize)>,
    title_entries: Vec<(String, usize)>,
}

impl CandidateIndex {
    /// 构建索引（同键多商品时保留拉取顺序中的第一个）
    pub fn build(products: Vec<CandidateProduct>) -> Self {
        let mut index = CandidateIndex::default();

        for (pos, product) in products.iter().enumerate() {
            if let Some(ean) = product.ean.as_deref().map(clean_ean) {
                if !ean.is_empty() && !is_synthetic(&ean) {
                    index.by_ean.entry(ean).or_insert(pos);
                }
            }

            for raw in [product.mpn.as_deref(), product.custom_mpn.as_deref()]
                .into_iter()
                .flatten()
            {
                let key = normalize(raw);
                if key.is_empty() {
                    continue;
                }
                index
                    .by_mpn_stripped
                    .entry(strip_leading_zeros(&key))
                    .or_insert(pos);
                index.by_mpn.entry(key.clone()).or_insert(pos);
                index.mpn_entries.push((key, pos));
            }

            if let Some(title) = product.title.as_deref() {
                let key = title.trim().to_lowercase();
                if !key.is_empty() {
                    index.by_title.entry(key.clone()).or_insert(pos);
                    index.title_entries.push((key, pos));
                }
            }
        }

        index.products = products;
        index
    }

    /// 由 products 表查询结果构建
    pub fn from_rows(rows: Vec<Row>) -> ImportResult<Self> {
        let products = rows
            .into_iter()
            .map(|row| serde_json::from_value::<CandidateProduct>(serde_json::Value::Object(row)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ImportError::CatalogFetchError(format!("目录行解析失败: {}", e)))?;
        Ok(Self::build(products))
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn lookup_ean(&self, raw: &str) -> Option<&CandidateProduct> {
        let key = clean_ean(raw);
        if key.is_empty() || is_synthetic(&key) {
            return None;
        }
        self.by_ean.get(&key).map(|&pos| &self.products[pos])
    }

    pub fn lookup_mpn(&self, raw: &str) -> Option<&CandidateProduct> {
        let key = normalize(raw);
        if key.is_empty() {
            return None;
        }
        if let Some(&pos) = self.by_mpn.get(&key) {
            return Some(&self.products[pos]);
        }
        if let Some(&pos) = self.by_mpn_stripped.get(&strip_leading_zeros(&key)) {
            return Some(&self.products[pos]);
        }

        if key.chars().count() < MIN_FUZZY_MPN_LEN {
            return None;
        }
        self.mpn_entries
            .iter()
            .find(|(entry, _)| {
                entry.chars().count() >= MIN_FUZZY_MPN_LEN
                    && (entry.contains(key.as_str()) || key.contains(entry.as_str()))
            })
            .map(|(_, pos)| &self.products[*pos])
    }

    pub fn lookup_name(&self, raw: &str) -> Option<&CandidateProduct> {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        if let Some(&pos) = self.by_title.get(&key) {
            return Some(&self.products[pos]);
        }
        self.title_entries
            .iter()
            .find(|(title, _)| title.contains(key.as_str()))
            .map(|(_, pos)| &self.products[*pos])
    }
}

/// 拉取目录并构建索引
///
/// # 返回
/// - Err(CatalogFetchError): 拉取失败（任务致命）
pub async fn load_candidate_index(store: &dyn RecordStore) -> ImportResult<CandidateIndex> {
    let rows = store
        .query(Table::Products, Filter::All)
        .await
        .map_err(|e| ImportError::CatalogFetchError(e.to_string()))?;
    let index = CandidateIndex::from_rows(rows)?;
    info!(
        products = index.len(),
        ean_keys = index.by_ean.len(),
        mpn_keys = index.by_mpn.len(),
        "目录索引已构建"
    );
    Ok(index)
}

// ==========================================
// 匹配结果
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub product_id: Option<i64>,
    pub method: MatchMethod,
}

impl Resolution {
    pub const UNMATCHED: Resolution = Resolution {
        product_id: None,
        method: MatchMethod::None,
    };
}

/// MPN 回填（目录商品缺少 MPN 时写入供应商 MPN）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpnBackfill {
    pub product_id: i64,
    pub mpn: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    pub group: SupplierGroup,
    pub resolutions: Vec<Resolution>, // 与 group.items 一一对应
}

impl ResolvedGroup {
    pub fn iter(&self) -> impl Iterator<Item = (&SupplierLineItem, Resolution)> {
        self.group.items.iter().zip(self.resolutions.iter().copied())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
    pub groups: Vec<ResolvedGroup>,
    pub backfills: Vec<MpnBackfill>,
    pub stats: MatchStats,
}

// ==========================================
// IdentityResolver
// ==========================================
pub struct IdentityResolver {
    order: Vec<MatchStrategy>,
    // 本任务已回填的商品，跨分块去重
    backfilled: HashSet<i64>,
}

impl IdentityResolver {
    pub fn new(options: &MatchOptions) -> Self {
        Self {
            order: options.effective_order(),
            backfilled: HashSet::new(),
        }
    }

    pub fn order(&self) -> &[MatchStrategy] {
        &self.order
    }

    fn try_strategy<'i>(
        index: &'i CandidateIndex,
        strategy: MatchStrategy,
        item: &SupplierLineItem,
    ) -> Option<&'i CandidateProduct> {
        let keys = &item.match_keys;
        match strategy {
            MatchStrategy::Ean => keys.ean.as_deref().and_then(|k| index.lookup_ean(k)),
            MatchStrategy::Mpn => keys.mpn.as_deref().and_then(|k| index.lookup_mpn(k)),
            MatchStrategy::Name => keys.name.as_deref().and_then(|k| index.lookup_name(k)),
        }
    }

    /// 匹配一个分块的全部供应商组
    ///
    /// 按优先级逐个策略扫描尚未匹配的行，命中即移出后续策略；
    /// 同一商品在整个任务内最多产生一次 MPN 回填
    pub fn resolve(&mut self, index: &CandidateIndex, groups: Vec<SupplierGroup>) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();

        for group in groups {
            let mut resolutions = vec![Resolution::UNMATCHED; group.items.len()];

            for &strategy in &self.order {
                for (item, resolution) in group.items.iter().zip(resolutions.iter_mut()) {
                    if resolution.method.is_matched() {
                        continue;
                    }
                    let Some(product) = Self::try_strategy(index, strategy, item) else {
                        continue;
                    };
                    *resolution = Resolution {
                        product_id: Some(product.id),
                        method: MatchMethod::from(strategy),
                    };

                    if strategy == MatchStrategy::Mpn && product.lacks_mpn() {
                        if let Some(mpn) = item.match_keys.mpn.as_deref().map(str::trim) {
                            if !mpn.is_empty() && self.backfilled.insert(product.id) {
                                outcome.backfills.push(MpnBackfill {
                                    product_id: product.id,
                                    mpn: mpn.to_string(),
                                });
                            }
                        }
                    }
                }
            }

            for resolution in &resolutions {
                outcome.stats.record(resolution.method);
            }
            debug!(
                supplier = %group.name,
                items = group.items.len(),
                matched = resolutions.iter().filter(|r| r.method.is_matched()).count(),
                "供应商组匹配完成"
            );
            outcome.groups.push(ResolvedGroup { group, resolutions });
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::supplier::MatchKeys;
    use std::collections::BTreeMap;

    fn product(id: i64, ean: Option<&str>, mpn: Option<&str>, title: Option<&str>) -> CandidateProduct {
        CandidateProduct {
            id,
            ean: ean.map(str::to_string),
            mpn: mpn.map(str::to_string),
            custom_mpn: None,
            title: title.map(str::to_string),
            brand: None,
        }
    }

    fn item(row: u64, ean: Option<&str>, mpn: Option<&str>, name: Option<&str>) -> SupplierLineItem {
        SupplierLineItem {
            row_number: row,
            supplier_name: "Acme".to_string(),
            product_name: name.map(str::to_string),
            brand: None,
            ean: ean.unwrap_or("SUPX").to_string(),
            ean_synthesized: ean.is_none(),
            mpn: mpn.map(str::to_string),
            cost: 0.0,
            supplier_stock: 0,
            moq: 1,
            lead_time: "3 days".to_string(),
            payment_terms: "Net 30".to_string(),
            custom_attributes: BTreeMap::new(),
            match_keys: MatchKeys {
                ean: ean.map(str::to_string),
                mpn: mpn.map(str::to_string),
                name: name.map(str::to_string),
            },
        }
    }

    fn resolve(
        catalog: Vec<CandidateProduct>,
        items: Vec<SupplierLineItem>,
        options: MatchOptions,
    ) -> ResolveOutcome {
        let index = CandidateIndex::build(catalog);
        IdentityResolver::new(&options).resolve(&index, SupplierGroup::group_items(items))
    }

    #[test]
    fn test_ean_match_and_unmatched() {
        let outcome = resolve(
            vec![product(1, Some("111"), None, Some("P1"))],
            vec![item(1, Some("111"), None, None), item(2, Some("222"), None, None)],
            MatchOptions::default(),
        );
        let resolutions = &outcome.groups[0].resolutions;
        assert_eq!(resolutions[0], Resolution { product_id: Some(1), method: MatchMethod::Ean });
        assert_eq!(resolutions[1], Resolution::UNMATCHED);
        assert_eq!(outcome.stats.total_matched, 1);
        assert_eq!(outcome.stats.unmatched_count, 1);
    }

    #[test]
    fn test_priority_short_circuit() {
        let catalog = vec![
            product(1, None, Some("MPN-9000"), None),
            product(2, Some("555"), None, None),
        ];
        let items = || vec![item(1, Some("555"), Some("MPN-9000"), None)];

        let ean_first = resolve(catalog.clone(), items(), MatchOptions::default());
        assert_eq!(ean_first.groups[0].resolutions[0].product_id, Some(2));
        assert_eq!(ean_first.groups[0].resolutions[0].method, MatchMethod::Ean);

        let mpn_first = MatchOptions {
            priority: vec![MatchStrategy::Mpn, MatchStrategy::Ean],
            ..MatchOptions::default()
        };
        let outcome = resolve(catalog, items(), mpn_first);
        assert_eq!(outcome.groups[0].resolutions[0].product_id, Some(1));
        assert_eq!(outcome.groups[0].resolutions[0].method, MatchMethod::Mpn);
    }

    #[test]
    fn test_mpn_fallbacks() {
        let index = CandidateIndex::build(vec![
            product(1, None, Some("00123-45"), None),
            product(2, None, Some("XY7"), None),
            product(3, None, Some("ABCD99-R"), None),
        ]);
        assert_eq!(index.lookup_mpn("12345").map(|p| p.id), Some(1));
        assert_eq!(index.lookup_mpn("abcd99").map(|p| p.id), Some(3));
        // 短 MPN 不做子串匹配
        assert!(index.lookup_mpn("XY").is_none());
        assert!(index.lookup_mpn("XY7Z").is_none());
        assert_eq!(index.lookup_mpn("xy-7").map(|p| p.id), Some(2));
    }

    #[test]
    fn test_custom_mpn_indexed() {
        let mut p = product(7, None, None, None);
        p.custom_mpn = Some("CUST-0042".to_string());
        let index = CandidateIndex::build(vec![p]);
        assert_eq!(index.lookup_mpn("cust0042").map(|p| p.id), Some(7));
    }

    #[test]
    fn test_name_match() {
        let index = CandidateIndex::build(vec![
            product(1, None, None, Some("Blue Widget Deluxe")),
            product(2, None, None, Some("Widget")),
        ]);
        assert_eq!(index.lookup_name("  WIDGET ").map(|p| p.id), Some(2));
        assert_eq!(index.lookup_name("blue widget").map(|p| p.id), Some(1));
        assert!(index.lookup_name("gadget").is_none());
    }

    #[test]
    fn test_synthetic_ean_never_matches() {
        let index = CandidateIndex::build(vec![product(1, Some("GEN123"), None, None)]);
        assert!(index.lookup_ean("GEN123").is_none());
    }

    #[test]
    fn test_backfill_for_product_without_mpn() {
        let mut p = product(4, None, None, None);
        p.custom_mpn = Some("ZZ-1000".to_string());
        let outcome = resolve(
            vec![p],
            vec![item(1, None, Some("ZZ-1000"), None), item(2, None, Some("zz1000"), None)],
            MatchOptions::default(),
        );
        assert_eq!(
            outcome.backfills,
            vec![MpnBackfill { product_id: 4, mpn: "ZZ-1000".to_string() }]
        );
        assert_eq!(outcome.stats.by_method.mpn, 2);
    }

    #[test]
    fn test_backfill_once_across_chunks() {
        let mut p = product(4, None, None, None);
        p.custom_mpn = Some("ZZ-1000".to_string());
        let index = CandidateIndex::build(vec![p]);
        let mut resolver = IdentityResolver::new(&MatchOptions::default());

        let first = resolver.resolve(
            &index,
            SupplierGroup::group_items(vec![item(1, None, Some("ZZ-1000"), None)]),
        );
        let second = resolver.resolve(
            &index,
            SupplierGroup::group_items(vec![item(2, None, Some("zz1000"), None)]),
        );
        assert_eq!(first.backfills.len(), 1);
        assert!(second.backfills.is_empty());
        assert_eq!(second.groups[0].resolutions[0].product_id, Some(4));

        // 新任务重新计数
        let mut next_job = IdentityResolver::new(&MatchOptions::default());
        let again = next_job.resolve(
            &index,
            SupplierGroup::group_items(vec![item(3, None, Some("ZZ-1000"), None)]),
        );
        assert_eq!(again.backfills.len(), 1);
    }

    #[test]
    fn test_disabled_strategy_skipped() {
        let options = MatchOptions {
            use_ean: false,
            ..MatchOptions::default()
        };
        let outcome = resolve(
            vec![product(1, Some("111"), None, None)],
            vec![item(1, Some("111"), None, None)],
            options,
        );
        assert_eq!(outcome.groups[0].resolutions[0], Resolution::UNMATCHED);
    }
}
