// ==========================================
// 供应商目录导入系统 - 标识符规范化
// ==========================================
// 职责: EAN / MPN 的可比较规范形式、科学计数法修复、合成标识符
// 红线: 纯函数，比较双方使用同一规范化
// ==========================================

use chrono::{DateTime, Utc};

/// 合成标识符最大长度
pub const SYNTHETIC_ID_MAX_LEN: usize = 30;

/// 目录商品合成 EAN 前缀
pub const PRODUCT_ID_PREFIX: &str = "GEN";

/// 供应商行合成 EAN 前缀
pub const SUPPLIER_ID_PREFIX: &str = "SUP";

/// 每个组成部分取的最大字符数
const SYNTHETIC_PART_LEN: usize = 4;

/// 规范化标识符：小写 + 只保留字母数字
///
/// `normalize("ABC-123") == normalize("  abc 123 ") == "abc123"`
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// 去掉前导零（全零保留 "0"）
pub fn strip_leading_zeros(normalized: &str) -> String {
    let stripped = normalized.trim_start_matches('0');
    if stripped.is_empty() && !normalized.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

/// 清洗 EAN：去首尾空白 + 去内部空白 + 修复科学计数法
pub fn clean_ean(raw: &str) -> String {
    let compact: String = raw.split_whitespace().collect();
    repair_scientific_notation(&compact)
}

/// 修复表格导出造成的科学计数法
///
/// - `8.40E+11` → `840000000000`
/// - `5E9` → `5000000000`
/// - `nan` / `none` / `null` / `undefined` → 空串
/// - 非科学计数法原样返回（去首尾空白）
///
/// 正指数按数字补位展开，不经过浮点运算
pub fn repair_scientific_notation(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }

    let lowered = value.to_lowercase();
    if matches!(lowered.as_str(), "nan" | "none" | "null" | "undefined") {
        return String::new();
    }

    if let Some(expanded) = expand_scientific(value) {
        return expanded;
    }

    // 整数样式的浮点（"840000000000.0"）
    if let Some((int_part, frac_part)) = value.split_once('.') {
        if !int_part.is_empty()
            && int_part.chars().all(|c| c.is_ascii_digit())
            && !frac_part.is_empty()
            && frac_part.chars().all(|c| c == '0')
            && int_part.len() > 10
        {
            return int_part.to_string();
        }
    }

    value.to_string()
}

/// 解析 `<digits>[.<digits>]e[+-]<digits>`，非该格式返回 None
fn expand_scientific(value: &str) -> Option<String> {
    let (mantissa, exponent) = value.split_once(|c: char| c == 'e' || c == 'E')?;

    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if mantissa.contains('.') && frac_part.is_empty() {
        return None;
    }

    let (negative, exp_digits) = match exponent.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, exponent.strip_prefix('+').unwrap_or(exponent)),
    };
    if exp_digits.is_empty() || !exp_digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let exp: usize = exp_digits.parse().ok()?;

    if negative {
        // 负指数不是条码，按浮点回写
        return value.parse::<f64>().ok().map(|f| {
            if f.fract() == 0.0 {
                format!("{}", f as i64)
            } else {
                format!("{}", f)
            }
        });
    }

    let mut digits = String::with_capacity(int_part.len() + frac_part.len() + exp);
    digits.push_str(int_part);
    digits.push_str(frac_part);

    let point = int_part.len() + exp;
    let expanded = if point >= digits.len() {
        let pad = point - digits.len();
        digits.extend(std::iter::repeat('0').take(pad));
        digits
    } else {
        let (whole, fraction) = digits.split_at(point);
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            whole.to_string()
        } else {
            format!("{}.{}", whole, fraction)
        }
    };

    let trimmed = expanded.trim_start_matches('0');
    if trimmed.is_empty() || trimmed.starts_with('.') {
        Some(format!("0{}", trimmed))
    } else {
        Some(trimmed.to_string())
    }
}

/// 生成确定性合成标识符
///
/// 格式: 前缀 + 各部分前 4 个大写字母数字 + 行号 [+ 时间戳毫秒]，截断到 30 字符
///
/// # 参数
/// - prefix: GEN（目录商品）/ SUP（供应商行）
/// - parts: 品牌、名称等
/// - row_number: 文件行号
/// - timestamp: 任务时间戳；None 时只由内容与行号决定（重复导入得到同一标识符）
pub fn synthesize_identifier(
    prefix: &str,
    parts: &[&str],
    row_number: u64,
    timestamp: Option<DateTime<Utc>>,
) -> String {
    let mut id = String::with_capacity(SYNTHETIC_ID_MAX_LEN * 2);
    id.push_str(prefix);

    for part in parts {
        id.extend(
            part.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_uppercase())
                .take(SYNTHETIC_PART_LEN),
        );
    }

    id.push_str(&row_number.to_string());
    if let Some(timestamp) = timestamp {
        id.push_str(&timestamp.timestamp_millis().to_string());
    }
    id.truncate(SYNTHETIC_ID_MAX_LEN);
    id
}

/// 是否为合成标识符（不参与 EAN 匹配）
pub fn is_synthetic(ean: &str) -> bool {
    ean.starts_with(PRODUCT_ID_PREFIX) || ean.starts_with(SUPPLIER_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_equivalence() {
        assert_eq!(normalize("ABC-123"), "abc123");
        assert_eq!(normalize("abc123"), normalize("  abc 123 "));
        assert_eq!(normalize("A.B/C_1"), "abc1");
        assert_eq!(normalize("---"), "");
    }

    #[test]
    fn test_strip_leading_zeros() {
        assert_eq!(strip_leading_zeros("000123"), "123");
        assert_eq!(strip_leading_zeros("0000"), "0");
        assert_eq!(strip_leading_zeros("abc"), "abc");
        assert_eq!(strip_leading_zeros(""), "");
    }

    #[test]
    fn test_repair_scientific_notation() {
        assert_eq!(repair_scientific_notation("8.40E+11"), "840000000000");
        assert_eq!(repair_scientific_notation("5E9"), "5000000000");
        assert_eq!(repair_scientific_notation("5e+3"), "5000");
        assert_eq!(repair_scientific_notation("1.2345E+2"), "123.45");
        assert_eq!(repair_scientific_notation(" 4006381333931 "), "4006381333931");
        assert_eq!(repair_scientific_notation("840000000000.0"), "840000000000");
        assert_eq!(repair_scientific_notation("NaN"), "");
        assert_eq!(repair_scientific_notation("undefined"), "");
        assert_eq!(repair_scientific_notation("ABC-E5"), "ABC-E5");
    }

    #[test]
    fn test_repair_large_exponent_pads_digits() {
        let repaired = repair_scientific_notation("1.5E+101");
        assert_eq!(repaired.len(), 102);
        assert!(repaired.starts_with("15"));
        assert!(repaired[2..].chars().all(|c| c == '0'));
    }

    #[test]
    fn test_clean_ean_removes_inner_whitespace() {
        assert_eq!(clean_ean(" 400 638 133 3931 "), "4006381333931");
        assert_eq!(clean_ean("8.40E +11"), "840000000000");
    }

    #[test]
    fn test_synthetic_identifier_shape() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let id = synthesize_identifier(PRODUCT_ID_PREFIX, &["Bosch Tools", "Drill Kit 18v"], 42, Some(ts));
        assert!(id.starts_with("GENBOSCDRIL42"));
        assert!(id.len() <= SYNTHETIC_ID_MAX_LEN);
        assert!(!id.chars().any(char::is_whitespace));
        assert!(is_synthetic(&id));

        let again = synthesize_identifier(PRODUCT_ID_PREFIX, &["Bosch Tools", "Drill Kit 18v"], 42, Some(ts));
        assert_eq!(id, again);
    }

    #[test]
    fn test_identifier_without_timestamp_is_stable() {
        let id = synthesize_identifier(SUPPLIER_ID_PREFIX, &["Acme Corp", "Blue Widget"], 7, None);
        assert_eq!(id, "SUPACMEBLUE7");
        assert_eq!(
            id,
            synthesize_identifier(SUPPLIER_ID_PREFIX, &["Acme Corp", "Blue Widget"], 7, None)
        );
    }

    #[test]
    fn test_is_synthetic() {
        assert!(is_synthetic("SUPACME1"));
        assert!(!is_synthetic("4006381333931"));
    }
}
