//! Clinisys (MySQL / CSV) → clinisys_all.db 的 bronze_* 表

use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::adapters::open_clinisys_source;
use crate::config::lake_config::{ClinisysTable, LakeConfig};
use crate::core::etl::blocking;
use crate::core::hashing::row_hash;
use crate::domain::model::{value_to_text, Record, StageContext, StageReport, Table};
use crate::domain::ports::{ClinisysSource, Stage};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

pub const EXTRACTION_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

/// 空字串視為 null，其餘值一律轉字串，再加上 hash 與萃取時間
pub fn prepare_bronze(table: Table, extraction_timestamp: &str) -> Table {
    let mut columns = table.columns.clone();
    for extra in ["hash", "extraction_timestamp"] {
        if !columns.iter().any(|c| c == extra) {
            columns.push(extra.to_string());
        }
    }

    let rows = table
        .rows
        .into_iter()
        .map(|row| {
            let mut record = Record::from_pairs(row.data.into_iter().map(|(k, v)| {
                let v = match value_to_text(&v) {
                    Some(s) if s.is_empty() => Value::Null,
                    Some(s) => Value::String(s),
                    None => Value::Null,
                };
                (k, v)
            }));
            let hash = row_hash(&record);
            record.insert("hash", Value::from(hash));
            record.insert("extraction_timestamp", Value::from(extraction_timestamp));
            record
        })
        .collect();

    Table {
        name: format!("bronze_{}", table.name),
        columns,
        rows,
    }
}

/// 只寫入 hash 尚未存在的列；回傳 (新增, 略過)
pub fn save_bronze(db: &LakeDb, table: Table) -> Result<(usize, usize)> {
    let existing: HashSet<String> = if db.table_exists(&table.name)? {
        db.text_set(&format!("SELECT hash FROM {}", quote_ident(&table.name)), &[])?
    } else {
        HashSet::new()
    };

    let total = table.rows.len();
    let mut seen = HashSet::new();
    let fresh: Vec<Record> = table
        .rows
        .into_iter()
        .filter(|r| match r.text("hash") {
            Some(h) => !existing.contains(&h) && seen.insert(h),
            None => true,
        })
        .collect();

    let inserted = db.append_rows(&table.name, &table.columns, &fresh)?;
    Ok((inserted, total - inserted))
}

/// `clinisys-bronze` 階段
pub struct ClinisysBronzeStage {
    config: Arc<LakeConfig>,
    tables: Option<Vec<String>>,
    source: Option<Arc<dyn ClinisysSource>>,
}

impl ClinisysBronzeStage {
    pub fn new(config: Arc<LakeConfig>, tables: Option<Vec<String>>) -> Self {
        Self {
            config,
            tables,
            source: None,
        }
    }

    /// 指定來源，不依設定開啟
    pub fn with_source(mut self, source: Arc<dyn ClinisysSource>) -> Self {
        self.source = Some(source);
        self
    }

    fn selected_tables(&self) -> Vec<ClinisysTable> {
        let configured = &self.config.clinisys.tables;
        match &self.tables {
            Some(filter) => {
                for name in filter {
                    if !configured.iter().any(|t| &t.name == name) {
                        tracing::warn!("⚠️ Table {} is not configured, skipping", name);
                    }
                }
                configured
                    .iter()
                    .filter(|t| filter.contains(&t.name))
                    .cloned()
                    .collect()
            }
            None => configured.clone(),
        }
    }

    async fn load_table(
        &self,
        source: &dyn ClinisysSource,
        table: &ClinisysTable,
        db_path: &Path,
    ) -> Result<(usize, usize)> {
        let fetched = source.fetch_table(&table.name, &table.query()).await?;
        if fetched.is_empty() {
            tracing::warn!("⚠️ {}: source returned no rows, nothing written", table.name);
            return Ok((0, 0));
        }

        let timestamp = chrono::Local::now().format(EXTRACTION_TS_FORMAT).to_string();
        let bronze = prepare_bronze(fetched, &timestamp);
        let path = db_path.to_path_buf();
        let (inserted, skipped) = blocking(move || save_bronze(&LakeDb::open(&path)?, bronze)).await?;
        tracing::info!(
            "💾 bronze_{}: {} new rows, {} already present",
            table.name,
            inserted,
            skipped
        );
        Ok((inserted, skipped))
    }
}

#[async_trait]
impl Stage for ClinisysBronzeStage {
    fn name(&self) -> &str {
        "clinisys-bronze"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let source: Arc<dyn ClinisysSource> = match &self.source {
            Some(source) => source.clone(),
            None => Arc::from(open_clinisys_source(&self.config.clinisys).await?),
        };
        let db_path = self.config.lake.clinisys_db_path();
        let tables = self.selected_tables();
        tracing::info!("📊 Loading {} Clinisys tables", tables.len());

        let mut report = StageReport::new(self.name());
        let mut failed = Vec::new();
        for table in &tables {
            match self.load_table(source.as_ref(), table, &db_path).await {
                Ok((inserted, skipped)) => {
                    report.rows_read += inserted + skipped;
                    report.rows_written += inserted;
                    report.tables.push(format!("bronze_{}", table.name));
                }
                Err(e) => {
                    tracing::error!("❌ {}: {}", table.name, e);
                    failed.push(table.name.clone());
                }
            }
        }

        tracing::info!(
            "📊 Clinisys bronze: {}/{} tables loaded, {} new rows",
            tables.len() - failed.len(),
            tables.len(),
            report.rows_written
        );
        if !tables.is_empty() && failed.len() == tables.len() {
            return Err(EtlError::SourceError {
                message: format!("All {} Clinisys tables failed", tables.len()),
            });
        }

        report.outputs.push(db_path.display().to_string());
        report
            .metadata
            .insert("failed_tables".to_string(), serde_json::json!(failed));
        Ok(report)
    }
}
