// ==========================================
// 供应商目录导入系统 - 命令行入口
// ==========================================
// 用法: supplier-catalog-import <db_path|-> <supplier|product> <file> [batch_size]
// db_path 为 "-" 时使用默认数据库路径
// ==========================================

use anyhow::{anyhow, Context, Result};
use std::fs;
use supplier_catalog_import::db::get_default_db_path;
use supplier_catalog_import::{logging, ImportApi, JobKind, SubmitJobRequest};

const USAGE: &str =
    "用法: supplier-catalog-import <db_path|-> <supplier|product> <file> [batch_size]";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        return Err(anyhow!(USAGE));
    }

    let db_path = if args[0] == "-" {
        let path = get_default_db_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
        }
        path.to_string_lossy().to_string()
    } else {
        args[0].clone()
    };

    let kind: JobKind = args[1].parse().map_err(|e: String| anyhow!(e))?;
    let mut request = SubmitJobRequest::new(kind, args[2].clone());
    if let Some(raw) = args.get(3) {
        let batch_size = raw
            .parse::<usize>()
            .with_context(|| format!("batch_size 无效: {}", raw))?;
        request.batch_size = Some(batch_size);
    }

    tracing::info!("==================================================");
    tracing::info!("{} v{}", supplier_catalog_import::APP_NAME, supplier_catalog_import::VERSION);
    tracing::info!("使用数据库: {}", db_path);
    tracing::info!("==================================================");

    let api = ImportApi::open(&db_path).await?;
    let job_id = api.submit_job(request).await?;
    api.wait_for_job(&job_id).await?;

    let view = api.get_job_status(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
