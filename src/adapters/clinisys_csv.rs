use crate::domain::model::{Record, Table};
use crate::domain::ports::ClinisysSource;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Clinisys 匯出的 CSV 檔：`{dir}/{table}.csv`，所有值都是字串
pub struct CsvClinisysSource {
    dir: PathBuf,
}

impl CsvClinisysSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", name))
    }
}

fn read_csv_table(path: &Path, name: &str) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut table = Table::new(name, headers.clone());
    for row in reader.records() {
        let row = row?;
        let record = Record::from_pairs(headers.iter().enumerate().map(|(i, column)| {
            let value = row
                .get(i)
                .map(|v| Value::from(v.to_string()))
                .unwrap_or(Value::Null);
            (column.clone(), value)
        }));
        table.push(record);
    }
    Ok(table)
}

#[async_trait]
impl ClinisysSource for CsvClinisysSource {
    /// CSV 來源忽略 query，整個檔案就是一張表
    async fn fetch_table(&self, name: &str, _query: &str) -> Result<Table> {
        let path = self.table_path(name);
        if !path.exists() {
            return Err(EtlError::SourceError {
                message: format!("CSV export not found: {}", path.display()),
            });
        }

        let table_name = name.to_string();
        let table = tokio::task::spawn_blocking(move || read_csv_table(&path, &table_name))
            .await
            .map_err(|e| EtlError::ProcessingError {
                message: format!("CSV reader task failed: {}", e),
            })??;

        tracing::info!("📥 Read {} rows from CSV export {}", table.len(), name);
        Ok(table)
    }
}
