//! 中央 DB 的表 → xlsx / csv (可打包成 zip)

use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::config::lake_config::{ExportTarget, LakeConfig};
use crate::core::etl::blocking;
use crate::domain::model::{value_to_text, StageContext, StageReport, Table};
use crate::domain::ports::{Stage, Storage};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use zip::write::{FileOptions, ZipWriter};

/// Excel 工作表最多 1,048,576 列，扣掉標題列
pub const EXCEL_MAX_DATA_ROWS: usize = 1_048_575;

const SHEET_NAME_MAX: usize = 31;
const COLUMN_WIDTH: f64 = 15.0;

fn excel_error(e: XlsxError) -> EtlError {
    EtlError::ExcelError {
        message: e.to_string(),
    }
}

pub fn sheet_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .take(SHEET_NAME_MAX)
        .collect();
    if cleaned.trim().is_empty() {
        "Sheet1".to_string()
    } else {
        cleaned
    }
}

pub fn to_xlsx(table: &Table, sheet: &str) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet_name(sheet)).map_err(excel_error)?;

    let header = Format::new().set_bold();
    for (col, name) in table.columns.iter().enumerate() {
        let col = col as u16;
        worksheet
            .write_string_with_format(0, col, name, &header)
            .map_err(excel_error)?;
        worksheet.set_column_width(col, COLUMN_WIDTH).map_err(excel_error)?;
    }

    if table.rows.len() > EXCEL_MAX_DATA_ROWS {
        tracing::warn!(
            "⚠️ {}: {} rows exceed the Excel limit, truncated to {}",
            table.name,
            table.rows.len(),
            EXCEL_MAX_DATA_ROWS
        );
    }

    for (idx, row) in table.rows.iter().take(EXCEL_MAX_DATA_ROWS).enumerate() {
        let r = idx as u32 + 1;
        for (col, name) in table.columns.iter().enumerate() {
            let col = col as u16;
            match row.get(name) {
                None | Some(Value::Null) => {}
                Some(Value::Number(n)) => {
                    if let Some(f) = n.as_f64() {
                        worksheet.write_number(r, col, f).map_err(excel_error)?;
                    }
                }
                Some(Value::Bool(b)) => {
                    worksheet.write_boolean(r, col, *b).map_err(excel_error)?;
                }
                Some(Value::String(s)) => {
                    worksheet.write_string(r, col, s).map_err(excel_error)?;
                }
                Some(other) => {
                    worksheet
                        .write_string(r, col, other.to_string())
                        .map_err(excel_error)?;
                }
            }
        }
    }

    workbook.save_to_buffer().map_err(excel_error)
}

pub fn to_csv(table: &Table) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(
            table
                .columns
                .iter()
                .map(|c| row.get(c).and_then(value_to_text).unwrap_or_default()),
        )?;
    }
    writer.into_inner().map_err(|e| EtlError::IoError(e.into_error()))
}

pub fn bundle_zip(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in files {
        zip.start_file::<_, ()>(name.as_str(), FileOptions::default())?;
        zip.write_all(data)?;
    }
    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn read_target(db_path: &Path, target: &ExportTarget) -> Result<Table> {
    let db = LakeDb::open(db_path)?;
    if !db.table_exists(&target.table)? {
        return Err(EtlError::ProcessingError {
            message: format!("Export table {} not found", target.table),
        });
    }
    let mut sql = format!("SELECT * FROM {}", quote_ident(&target.table));
    if let Some(filter) = target.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    db.query_table(&target.table, &sql, &[])
}

/// 產生單一目標的所有檔案 (檔名, 內容)
pub fn render_target(table: &Table, target: &ExportTarget, timestamp: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let stem = format!("{}_{}", target.file_stem(), timestamp);
    let mut files = Vec::new();
    for format in &target.formats {
        match format.to_lowercase().as_str() {
            "xlsx" => files.push((format!("{}.xlsx", stem), to_xlsx(table, &target.name)?)),
            "csv" => files.push((format!("{}.csv", stem), to_csv(table)?)),
            other => {
                return Err(EtlError::InvalidConfigValueError {
                    field: format!("export.targets.{}.formats", target.name),
                    value: other.to_string(),
                    reason: "Expected xlsx or csv".to_string(),
                })
            }
        }
    }

    if target.bundle {
        let zipped = bundle_zip(&files)?;
        return Ok(vec![(format!("{}.zip", stem), zipped)]);
    }
    Ok(files)
}

/// `export` 階段
pub struct ExportStage<S: Storage> {
    config: Arc<LakeConfig>,
    storage: S,
    target: Option<String>,
}

impl<S: Storage> ExportStage<S> {
    pub fn new(config: Arc<LakeConfig>, storage: S, target: Option<String>) -> Self {
        Self {
            config,
            storage,
            target,
        }
    }

    fn targets(&self) -> Vec<ExportTarget> {
        self.config
            .export
            .targets
            .iter()
            .filter(|t| self.target.as_ref().map(|name| &t.name == name).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<S: Storage> Stage for ExportStage<S> {
    fn name(&self) -> &str {
        "export"
    }

    fn should_execute(&self, _context: &StageContext) -> bool {
        let has_targets = !self.targets().is_empty();
        if !has_targets {
            match &self.target {
                Some(name) => tracing::warn!("⚠️ Export target {} is not configured", name),
                None => tracing::info!("⏭️ No export targets configured"),
            }
        }
        has_targets
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let db_path = self.config.lake.central_db_path();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut report = StageReport::new(self.name());

        for target in self.targets() {
            let (path, t, ts) = (db_path.clone(), target.clone(), timestamp.clone());
            let (rows, files) = blocking(move || {
                let table = read_target(&path, &t)?;
                let files = render_target(&table, &t, &ts)?;
                Ok((table.len(), files))
            })
            .await?;
            tracing::info!("📥 {}: {} rows from {}", target.name, rows, target.table);
            report.rows_read += rows;

            for (name, data) in files {
                self.storage.write_file(&name, &data).await?;
                tracing::info!("💾 Exported {} ({} bytes)", name, data.len());
                report.outputs.push(name);
            }
            report.rows_written += rows;
            report.tables.push(target.table.clone());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Record;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Read;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockStorage {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl Storage for MockStorage {
        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            let files = self.files.lock().await;
            files.get(path).cloned().ok_or_else(|| {
                EtlError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path),
                ))
            })
        }

        async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
            self.files.lock().await.insert(path.to_string(), data.to_vec());
            Ok(())
        }
    }

    fn sample() -> Table {
        Table::from_records(
            "gold_embryoscope_clinisys_combined",
            vec![
                Record::from_pairs([("id", json!(1)), ("name", json!("Ana, Lima")), ("score", json!(7.5))]),
                Record::from_pairs([("id", json!(2)), ("name", Value::Null), ("score", json!(true))]),
            ],
        )
    }

    #[test]
    fn test_sheet_name_rules() {
        assert_eq!(sheet_name("combined/embryos"), "combined_embryos");
        assert_eq!(sheet_name(&"x".repeat(40)).len(), 31);
        assert_eq!(sheet_name(""), "Sheet1");
    }

    #[test]
    fn test_csv_quotes_and_blanks() {
        let csv = String::from_utf8(to_csv(&sample()).unwrap()).unwrap();
        assert_eq!(csv, "id,name,score\n1,\"Ana, Lima\",7.5\n2,,true\n");
    }

    #[test]
    fn test_bundle_holds_every_format() {
        let target = ExportTarget {
            name: "combined".to_string(),
            table: "gold_embryoscope_clinisys_combined".to_string(),
            filter: None,
            file_stem: Some("embrioes".to_string()),
            formats: vec!["xlsx".to_string(), "csv".to_string()],
            bundle: true,
        };
        let files = render_target(&sample(), &target, "20240501_101500").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "embrioes_20240501_101500.zip");

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(files[0].1.clone())).unwrap();
        assert_eq!(archive.len(), 2);
        let mut csv = String::new();
        archive
            .by_name("embrioes_20240501_101500.csv")
            .unwrap()
            .read_to_string(&mut csv)
            .unwrap();
        assert!(csv.starts_with("id,name,score"));
        assert!(archive.by_name("embrioes_20240501_101500.xlsx").is_ok());
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let target = ExportTarget {
            name: "combined".to_string(),
            table: "t".to_string(),
            filter: None,
            file_stem: None,
            formats: vec!["parquet".to_string()],
            bundle: false,
        };
        assert!(render_target(&sample(), &target, "ts").is_err());
    }

    fn export_config(dir: &tempfile::TempDir, filter: Option<&str>) -> LakeConfig {
        let mut config = LakeConfig::default();
        config.lake.root = dir.path().to_string_lossy().to_string();
        config.export.targets = vec![ExportTarget {
            name: "combined".to_string(),
            table: "gold_embryoscope_clinisys_combined".to_string(),
            filter: filter.map(str::to_string),
            file_stem: None,
            formats: vec!["csv".to_string(), "xlsx".to_string()],
            bundle: false,
        }];
        config
    }

    #[tokio::test]
    async fn test_stage_writes_filtered_rows_through_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Arc::new(export_config(&dir, Some("id > 1")));
        LakeDb::open(config.lake.central_db_path())
            .unwrap()
            .replace_table(&sample())
            .unwrap();

        let storage = MockStorage::default();
        let stage = ExportStage::new(config, storage.clone(), None);
        let report = stage.run(&StageContext::new("test")).await.unwrap();

        assert_eq!(report.rows_read, 1);
        assert_eq!(report.outputs.len(), 2);
        let csv_name = report.outputs.iter().find(|n| n.ends_with(".csv")).unwrap();
        assert!(csv_name.starts_with("combined_"));
        let csv = String::from_utf8(storage.read_file(csv_name).await.unwrap()).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.lines().nth(1).unwrap().starts_with("2,"));
    }

    #[tokio::test]
    async fn test_stage_skips_without_targets_and_fails_on_missing_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut empty = export_config(&dir, None);
        empty.export.targets.clear();
        let stage = ExportStage::new(Arc::new(empty), MockStorage::default(), None);
        assert!(!stage.should_execute(&StageContext::new("test")));

        let stage = ExportStage::new(Arc::new(export_config(&dir, None)), MockStorage::default(), None);
        let err = stage.run(&StageContext::new("test")).await.unwrap_err();
        assert!(matches!(err, EtlError::ProcessingError { .. }));
    }
}
