// ==========================================
// 供应商目录导入系统 - 批量写入
// ==========================================
// 职责: 匹配结果 / 商品记录按批写入 RecordStore
// 供应商: upsert suppliers(name) → 已匹配 upsert (supplier_id, product_id)
//         → 未匹配按 (supplier_id, ean 集合) 先删后插
// 商品: upsert products(ean)，同一次导入内重复 EAN 计为失败
// 红线: 单批失败只记录，不中断后续批次
// ==========================================

use crate::domain::catalog::ProductRecord;
use crate::domain::supplier::{SupplierLineItem, SupplierProductLink};
use crate::domain::types::MatchMethod;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::identity_resolver::ResolvedGroup;
use crate::repository::record_store::{Filter, RecordStore, Row, Table};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ==========================================
// 写入阶段
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Suppliers,
    MatchedLinks,
    UnmatchedLinks,
    Products,
}

impl WriteStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStage::Suppliers => "suppliers",
            WriteStage::MatchedLinks => "matched_links",
            WriteStage::UnmatchedLinks => "unmatched_links",
            WriteStage::Products => "products",
        }
    }
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单批失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub stage: WriteStage,
    pub rows: u64,
    pub message: String,
}

impl BatchFailure {
    pub fn to_error(&self) -> ImportError {
        ImportError::BatchWriteError {
            stage: self.stage.to_string(),
            rows: self.rows as usize,
            message: self.message.clone(),
        }
    }
}

/// 一个分块的写入报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkWriteReport {
    pub successful: u64,
    pub failed: u64,
    pub suppliers_added: u64,
    pub products_upserted: u64,
    pub duplicate_rows: u64, // 已计入 failed
    pub failures: Vec<BatchFailure>,
}

impl ChunkWriteReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, stage: WriteStage, rows: u64, message: impl Into<String>) {
        let failure = BatchFailure {
            stage,
            rows,
            message: message.into(),
        };
        warn!(stage = %stage, rows, error = %failure.message, "批次写入失败");
        self.failed += rows;
        self.failures.push(failure);
    }
}

/// 未匹配关联去重报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub groups_examined: u64,
    pub duplicate_groups: u64,
    pub rows_removed: u64,
}

/// 序列化为存储行
fn into_row<T: Serialize>(value: &T) -> ImportResult<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ImportError::InternalError(format!(
            "无法转换为存储行: {}",
            other
        ))),
    }
}

/// 分块内去重后的关联（weight = 折叠进该键的源行数）
struct PendingLink {
    link: SupplierProductLink,
    weight: u64,
}

// ==========================================
// BatchWriter
// ==========================================
pub struct BatchWriter {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    seen_eans: HashSet<String>, // 商品导入：本次运行已写入的 EAN
}

impl BatchWriter {
    /// 创建批量写入器
    ///
    /// # 参数
    /// - store: 记录存储
    /// - batch_size: 单次写入行数上限（已按配置钳制）
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            seen_eans: HashSet::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    // ==========================================
    // 供应商报价
    // ==========================================

    /// 写入一个分块的供应商报价
    pub async fn write_supplier_chunk(&self, groups: &[ResolvedGroup]) -> ChunkWriteReport {
        let mut report = ChunkWriteReport::default();
        let total_rows: u64 = groups.iter().map(|g| g.group.items.len() as u64).sum();
        if total_rows == 0 {
            return report;
        }

        // ===== 1. 供应商 =====
        let names: Vec<String> = groups.iter().map(|g| g.group.name.clone()).collect();
        let existing = match self.existing_supplier_names(&names).await {
            Ok(existing) => existing,
            Err(e) => {
                report.fail(WriteStage::Suppliers, total_rows, e.to_string());
                return report;
            }
        };

        let mut rows_by_supplier: HashMap<&str, u64> = HashMap::new();
        for group in groups {
            *rows_by_supplier.entry(group.group.name.as_str()).or_default() +=
                group.group.items.len() as u64;
        }

        let now = Utc::now().to_rfc3339();
        let mut supplier_rows: Vec<(String, Row)> = Vec::new();
        let mut queued: HashSet<&str> = HashSet::new();
        for group in groups {
            if !queued.insert(group.group.name.as_str()) {
                continue;
            }
            let mut row = Row::new();
            row.insert("name".to_string(), Value::from(group.group.name.clone()));
            row.insert(
                "custom_attributes".to_string(),
                serde_json::to_value(&group.group.custom_attributes).unwrap_or(Value::Null),
            );
            row.insert("created_at".to_string(), Value::from(now.clone()));
            row.insert("updated_at".to_string(), Value::from(now.clone()));
            supplier_rows.push((group.group.name.clone(), row));
        }

        let mut written_names: Vec<String> = Vec::new();
        for batch in supplier_rows.chunks(self.batch_size) {
            let batch_names: Vec<&str> = batch.iter().map(|(name, _)| name.as_str()).collect();
            let rows: Vec<Row> = batch.iter().map(|(_, row)| row.clone()).collect();
            match self.store.upsert(Table::Suppliers, rows, &["name"]).await {
                Ok(_) => {
                    for name in batch_names {
                        if !existing.contains(name) {
                            report.suppliers_added += 1;
                        }
                        written_names.push(name.to_string());
                    }
                }
                Err(e) => {
                    let rows: u64 = batch_names
                        .iter()
                        .map(|n| rows_by_supplier.get(n).copied().unwrap_or(0))
                        .sum();
                    report.fail(WriteStage::Suppliers, rows, e.to_string());
                }
            }
        }

        if written_names.is_empty() {
            return report;
        }

        let supplier_ids = match self.supplier_ids(&written_names).await {
            Ok(ids) => ids,
            Err(e) => {
                let rows: u64 = written_names
                    .iter()
                    .map(|n| rows_by_supplier.get(n.as_str()).copied().unwrap_or(0))
                    .sum();
                report.fail(WriteStage::Suppliers, rows, e.to_string());
                return report;
            }
        };

        // ===== 2. 构造关联并分块内去重（后出现者覆盖）=====
        let mut matched: Vec<PendingLink> = Vec::new();
        let mut matched_pos: HashMap<(i64, i64), usize> = HashMap::new();
        let mut unmatched: Vec<PendingLink> = Vec::new();
        let mut unmatched_pos: HashMap<(i64, String), usize> = HashMap::new();

        for group in groups {
            let Some(&supplier_id) = supplier_ids.get(&group.group.name) else {
                // 写入失败的供应商行数已计入
                if written_names.contains(&group.group.name) {
                    report.fail(
                        WriteStage::Suppliers,
                        group.group.items.len() as u64,
                        format!("供应商 ID 未找到: {}", group.group.name),
                    );
                }
                continue;
            };
            for (item, resolution) in group.iter() {
                let link = SupplierProductLink::from_item(
                    supplier_id,
                    item,
                    resolution.product_id,
                    resolution.method,
                );
                match link.product_id {
                    Some(product_id) => Self::collapse(
                        &mut matched,
                        &mut matched_pos,
                        (supplier_id, product_id),
                        link,
                    ),
                    None => {
                        let key = (supplier_id, link.ean.clone());
                        Self::collapse(&mut unmatched, &mut unmatched_pos, key, link)
                    }
                }
            }
        }

        // ===== 3. 已匹配 upsert =====
        for batch in matched.chunks(self.batch_size) {
            let weight: u64 = batch.iter().map(|p| p.weight).sum();
            let rows = match batch.iter().map(|p| Self::link_row(&p.link, &now)).collect::<ImportResult<Vec<_>>>() {
                Ok(rows) => rows,
                Err(e) => {
                    report.fail(WriteStage::MatchedLinks, weight, e.to_string());
                    continue;
                }
            };
            match self
                .store
                .upsert(Table::SupplierProducts, rows, &["supplier_id", "product_id"])
                .await
            {
                Ok(_) => report.successful += weight,
                Err(e) => report.fail(WriteStage::MatchedLinks, weight, e.to_string()),
            }
        }

        // ===== 4. 未匹配先删后插 =====
        for batch in unmatched.chunks(self.batch_size) {
            let weight: u64 = batch.iter().map(|p| p.weight).sum();
            match self.replace_unmatched(batch, &now).await {
                Ok(()) => report.successful += weight,
                Err(e) => report.fail(WriteStage::UnmatchedLinks, weight, e.to_string()),
            }
        }

        debug!(
            rows = total_rows,
            matched_keys = matched.len(),
            unmatched_keys = unmatched.len(),
            successful = report.successful,
            failed = report.failed,
            "供应商分块写入完成"
        );
        report
    }

    fn collapse<K: std::hash::Hash + Eq>(
        links: &mut Vec<PendingLink>,
        positions: &mut HashMap<K, usize>,
        key: K,
        link: SupplierProductLink,
    ) {
        match positions.get(&key) {
            Some(&pos) => {
                links[pos].link = link;
                links[pos].weight += 1;
            }
            None => {
                positions.insert(key, links.len());
                links.push(PendingLink { link, weight: 1 });
            }
        }
    }

    fn link_row(link: &SupplierProductLink, now: &str) -> ImportResult<Row> {
        let mut row = into_row(link)?;
        row.insert("created_at".to_string(), Value::from(now.to_string()));
        Ok(row)
    }

    async fn existing_supplier_names(&self, names: &[String]) -> ImportResult<HashSet<String>> {
        let rows = self
            .store
            .query(Table::Suppliers, Filter::is_in("name", names.iter().cloned()))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn supplier_ids(&self, names: &[String]) -> ImportResult<HashMap<String, i64>> {
        let rows = self
            .store
            .query(Table::Suppliers, Filter::is_in("name", names.iter().cloned()))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.get("name")?.as_str()?.to_string();
                let id = row.get("id")?.as_i64()?;
                Some((name, id))
            })
            .collect())
    }

    async fn replace_unmatched(&self, batch: &[PendingLink], now: &str) -> ImportResult<()> {
        let mut eans_by_supplier: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for pending in batch {
            eans_by_supplier
                .entry(pending.link.supplier_id)
                .or_default()
                .push(pending.link.ean.clone());
        }

        for (supplier_id, eans) in eans_by_supplier {
            self.store
                .delete(
                    Table::SupplierProducts,
                    Filter::and(vec![
                        Filter::eq("supplier_id", supplier_id),
                        Filter::is_null("product_id"),
                        Filter::is_in("ean", eans),
                    ]),
                )
                .await?;
        }

        let rows = batch
            .iter()
            .map(|p| Self::link_row(&p.link, now))
            .collect::<ImportResult<Vec<_>>>()?;
        self.store.insert(Table::SupplierProducts, rows).await?;
        Ok(())
    }

    // ==========================================
    // 商品导入
    // ==========================================

    /// 写入一个分块的商品记录
    pub async fn write_product_chunk(&mut self, records: Vec<ProductRecord>) -> ChunkWriteReport {
        let mut report = ChunkWriteReport::default();
        let now = Utc::now().to_rfc3339();

        let mut fresh: Vec<ProductRecord> = Vec::with_capacity(records.len());
        for record in records {
            if self.seen_eans.insert(record.ean.clone()) {
                fresh.push(record);
            } else {
                debug!(row = record.row_number, ean = %record.ean, "重复 EAN，已跳过");
                report.duplicate_rows += 1;
                report.failed += 1;
            }
        }

        for batch in fresh.chunks(self.batch_size) {
            let rows = batch
                .iter()
                .map(|record| {
                    let mut row = into_row(record)?;
                    row.insert("created_at".to_string(), Value::from(now.clone()));
                    Ok(row)
                })
                .collect::<ImportResult<Vec<_>>>();
            let rows = match rows {
                Ok(rows) => rows,
                Err(e) => {
                    report.fail(WriteStage::Products, batch.len() as u64, e.to_string());
                    continue;
                }
            };

            match self.store.upsert(Table::Products, rows, &["ean"]).await {
                Ok(_) => {
                    report.successful += batch.len() as u64;
                    report.products_upserted += batch.len() as u64;
                }
                Err(e) => report.fail(WriteStage::Products, batch.len() as u64, e.to_string()),
            }
        }

        report
    }

    // ==========================================
    // 维护
    // ==========================================

    /// 清理历史导入遗留的重复未匹配关联
    ///
    /// 同一 (supplier_id, ean) 仅保留 updated_at 最新的一行（相同时保留 id 最大者）
    pub async fn dedupe_unmatched_links(&self) -> ImportResult<DedupeReport> {
        let rows = self
            .store
            .query(
                Table::SupplierProducts,
                Filter::and(vec![
                    Filter::is_null("product_id"),
                    Filter::eq("match_method", MatchMethod::None.as_str()),
                ]),
            )
            .await?;

        let mut latest: HashMap<(i64, String), (String, i64)> = HashMap::new();
        let mut all: Vec<((i64, String), i64)> = Vec::with_capacity(rows.len());

        for row in &rows {
            let (Some(id), Some(supplier_id), Some(ean)) = (
                row.get("id").and_then(Value::as_i64),
                row.get("supplier_id").and_then(Value::as_i64),
                row.get("ean").and_then(Value::as_str),
            ) else {
                continue;
            };
            let updated_at = row
                .get("updated_at")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let key = (supplier_id, ean.to_string());

            let replace = match latest.get(&key) {
                Some((best_at, best_id)) => (updated_at.as_str(), id) > (best_at.as_str(), *best_id),
                None => true,
            };
            if replace {
                latest.insert(key.clone(), (updated_at, id));
            }
            all.push((key, id));
        }

        let mut report = DedupeReport {
            groups_examined: latest.len() as u64,
            ..DedupeReport::default()
        };

        let doomed: Vec<i64> = all
            .iter()
            .filter(|(key, id)| latest.get(key).map(|(_, keep)| keep != id).unwrap_or(false))
            .map(|(_, id)| *id)
            .collect();

        let mut duplicate_keys: HashSet<&(i64, String)> = HashSet::new();
        for (key, id) in &all {
            if latest.get(key).map(|(_, keep)| keep != id).unwrap_or(false) {
                duplicate_keys.insert(key);
            }
        }
        report.duplicate_groups = duplicate_keys.len() as u64;

        for batch in doomed.chunks(self.batch_size) {
            let removed = self
                .store
                .delete(Table::SupplierProducts, Filter::is_in("id", batch.iter().copied()))
                .await?;
            report.rows_removed += removed as u64;
        }

        info!(
            groups = report.groups_examined,
            duplicate_groups = report.duplicate_groups,
            removed = report.rows_removed,
            "未匹配关联去重完成"
        );
        Ok(report)
    }
}
