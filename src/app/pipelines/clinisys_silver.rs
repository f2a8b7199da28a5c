//! clinisys_all.db：bronze_* → silver_*

use crate::adapters::lake_db::LakeDb;
use crate::config::lake_config::{ClinisysSettings, LakeConfig};
use crate::core::casting::{cast_clinisys_value, ColumnClassifier};
use crate::core::etl::blocking;
use crate::core::features::{add_oocyte_features, add_prescription_features, add_treatment_features};
use crate::core::patient_id::clean_prontuario;
use crate::domain::model::{StageContext, StageReport, Table};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// 每個主鍵只留 extraction_timestamp 最新的一列
pub fn dedup_by_key(table: &mut Table, key: &str) -> usize {
    if !table.has_column(key) {
        tracing::warn!("⚠️ {}: primary key {} not found, no dedup", table.name, key);
        return 0;
    }
    let before = table.rows.len();
    // bronze 的時間格式 %Y%m%d_%H%M%S 可直接字串排序
    table
        .rows
        .sort_by(|a, b| b.text("extraction_timestamp").cmp(&a.text("extraction_timestamp")));
    let mut seen = HashSet::new();
    table.rows.retain(|row| match row.text(key) {
        Some(k) => seen.insert(k),
        None => true,
    });
    before - table.rows.len()
}

pub fn cast_table(table: &mut Table, classifier: &ColumnClassifier, now: NaiveDateTime) {
    let kinds: Vec<_> = table
        .columns
        .iter()
        .map(|c| (c.clone(), classifier.kind(c)))
        .collect();
    for row in table.rows.iter_mut() {
        for (column, kind) in &kinds {
            let value = row.get(column).cloned().unwrap_or(Value::Null);
            row.insert(column.clone(), cast_clinisys_value(*kind, &value, now));
        }
    }
}

/// 所有含 `prontuario` 的欄位轉整數；view_pacientes 以外的表移除全部無效的列
pub fn clean_prontuario_columns(table: &mut Table, view: &str) -> usize {
    let columns: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.contains("prontuario"))
        .cloned()
        .collect();
    if columns.is_empty() {
        return 0;
    }

    for row in table.rows.iter_mut() {
        for column in &columns {
            let cleaned = row
                .get(column)
                .and_then(clean_prontuario)
                .map(Value::from)
                .unwrap_or(Value::Null);
            row.insert(column.clone(), cleaned);
        }
    }

    if view == "view_pacientes" {
        return 0;
    }

    let before = table.rows.len();
    let mut sample = Vec::new();
    table.rows.retain(|row| {
        let valid = columns.iter().any(|c| !row.is_null(c));
        if !valid && sample.len() < 5 {
            sample.push(row.text("id").or_else(|| row.text("codigo")).unwrap_or_default());
        }
        valid
    });
    let removed = before - table.rows.len();
    if removed > 0 {
        tracing::warn!(
            "⚠️ {}: removed {} rows without a valid prontuario (sample ids: {:?})",
            table.name,
            removed,
            sample
        );
    }
    removed
}

fn medication_names(db: &LakeDb) -> Result<HashMap<i64, String>> {
    if !db.table_exists("silver_view_medicamentos")? {
        tracing::warn!("⚠️ silver_view_medicamentos not found, med_nome will be empty");
        return Ok(HashMap::new());
    }
    let rows = db.query_records("SELECT id, medicamento FROM silver_view_medicamentos", &[])?;
    Ok(rows
        .iter()
        .filter_map(|r| Some((r.int("id")?, r.text("medicamento")?)))
        .collect())
}

/// 單一 bronze 表 → silver；回傳寫入筆數
pub fn transform_table(
    db: &LakeDb,
    bronze_name: &str,
    settings: &ClinisysSettings,
    classifier: &ColumnClassifier,
    now: NaiveDateTime,
) -> Result<usize> {
    let view = bronze_name.trim_start_matches("bronze_");
    let mut table = db.read_table(bronze_name)?;
    let bronze_columns = table.columns.len();
    table.name = format!("silver_{}", view);

    let removed = dedup_by_key(&mut table, &settings.primary_key(view));
    if removed > 0 {
        tracing::info!("🔄 {}: {} older versions removed", table.name, removed);
    }

    cast_table(&mut table, classifier, now);

    match view {
        "view_micromanipulacao_oocitos" => add_oocyte_features(&mut table),
        "view_tratamentos" => add_treatment_features(&mut table),
        "view_medicamentos_prescricoes" => {
            let names = medication_names(db)?;
            add_prescription_features(&mut table, &names);
        }
        _ => {}
    }

    clean_prontuario_columns(&mut table, view);

    if table.columns.is_empty() {
        return Err(EtlError::ProcessingError {
            message: format!("{} has no columns", bronze_name),
        });
    }
    let written = db.replace_table(&table)?;
    tracing::info!(
        "💾 {}: {} rows ({} bronze columns → {} silver columns)",
        table.name,
        written,
        bronze_columns,
        table.columns.len()
    );
    Ok(written)
}

pub fn transform_all(db_path: &Path, settings: &ClinisysSettings) -> Result<BTreeMap<String, Result<usize>>> {
    let db = LakeDb::open(db_path)?;
    let classifier = ColumnClassifier::new(&settings.columns);
    let now = chrono::Local::now().naive_local();

    // list_tables 依名稱排序，view_medicamentos 會先於 prescricoes
    let mut results = BTreeMap::new();
    for bronze in db.list_tables("bronze_")? {
        let outcome = transform_table(&db, &bronze, settings, &classifier, now);
        if let Err(e) = &outcome {
            tracing::error!("❌ {}: {}", bronze, e);
        }
        results.insert(bronze, outcome);
    }
    Ok(results)
}

/// `clinisys-silver` 階段
pub struct ClinisysSilverStage {
    config: Arc<LakeConfig>,
}

impl ClinisysSilverStage {
    pub fn new(config: Arc<LakeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for ClinisysSilverStage {
    fn name(&self) -> &str {
        "clinisys-silver"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let db_path = self.config.lake.clinisys_db_path();
        if !db_path.exists() {
            return Err(EtlError::ProcessingError {
                message: format!("{} not found; run clinisys-bronze first", db_path.display()),
            });
        }

        let settings = self.config.clinisys.clone();
        let path = db_path.clone();
        let results = blocking(move || transform_all(&path, &settings)).await?;

        let mut report = StageReport::new(self.name());
        let mut failed = Vec::new();
        for (bronze, outcome) in results {
            match outcome {
                Ok(n) => {
                    report.rows_written += n;
                    report.tables.push(bronze.replacen("bronze_", "silver_", 1));
                }
                Err(e) => failed.push(format!("{}: {}", bronze, e)),
            }
        }
        tracing::info!(
            "📊 Clinisys silver: {} tables written, {} failed",
            report.tables.len(),
            failed.len()
        );
        if report.tables.is_empty() {
            return Err(EtlError::ProcessingError {
                message: match failed.first() {
                    Some(first) => format!("No Clinisys table transformed ({})", first),
                    None => "No bronze_* tables found".to_string(),
                },
            });
        }
        report.outputs.push(db_path.display().to_string());
        report
            .metadata
            .insert("failed_tables".to_string(), serde_json::json!(failed));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::pipelines::clinisys_bronze::{prepare_bronze, save_bronze};
    use crate::domain::model::Record;
    use serde_json::json;

    #[test]
    fn test_dedup_keeps_latest_version() {
        let mut table = Table::from_records(
            "bronze_view_pacientes",
            vec![
                Record::from_pairs([("codigo", json!("1")), ("nome", json!("old")), ("extraction_timestamp", json!("20240101_000000"))]),
                Record::from_pairs([("codigo", json!("1")), ("nome", json!("new")), ("extraction_timestamp", json!("20240201_000000"))]),
            ],
        );
        assert_eq!(dedup_by_key(&mut table, "codigo"), 1);
        assert_eq!(table.rows[0].text("nome").as_deref(), Some("new"));
    }

    #[test]
    fn test_prontuario_cleaning_drops_invalid_rows() {
        let mut table = Table::from_records(
            "silver_view_tratamentos",
            vec![
                Record::from_pairs([("id", json!(1)), ("prontuario", json!("520124"))]),
                Record::from_pairs([("id", json!(2)), ("prontuario", json!("0"))]),
                Record::from_pairs([("id", json!(3)), ("prontuario", json!("abc"))]),
            ],
        );
        assert_eq!(clean_prontuario_columns(&mut table, "view_tratamentos"), 2);
        assert_eq!(table.rows[0].int("prontuario"), Some(520124));

        let mut pacientes = Table::from_records(
            "silver_view_pacientes",
            vec![Record::from_pairs([("codigo", json!(9)), ("prontuario_esposa", json!("x"))])],
        );
        assert_eq!(clean_prontuario_columns(&mut pacientes, "view_pacientes"), 0);
        assert_eq!(pacientes.len(), 1);
    }

    #[test]
    fn test_transform_all_casts_and_adds_features() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clinisys_all.db");
        let db = LakeDb::open(&path).unwrap();
        save_bronze(
            &db,
            prepare_bronze(
                Table::from_records(
                    "view_micromanipulacao_oocitos",
                    vec![
                        Record::from_pairs([("id", json!("11")), ("id_micromanipulacao", json!("5")), ("InseminacaoOocito", json!("ICSI")), ("prontuario", json!("100"))]),
                        Record::from_pairs([("id", json!("10")), ("id_micromanipulacao", json!("5")), ("InseminacaoOocito", json!("")), ("prontuario", json!("100"))]),
                    ],
                ),
                "20240101_000000",
            ),
        )
        .unwrap();
        drop(db);

        let results = transform_all(&path, &ClinisysSettings::default()).unwrap();
        assert_eq!(results["bronze_view_micromanipulacao_oocitos"].as_ref().ok(), Some(&2));

        let db = LakeDb::open(&path).unwrap();
        let rows = db
            .query_records(
                "SELECT id, flag_embryoscope, embryo_number, extraction_timestamp FROM silver_view_micromanipulacao_oocitos ORDER BY id",
                &[],
            )
            .unwrap();
        assert_eq!(rows[0].int("id"), Some(10));
        assert_eq!(rows[0].int("flag_embryoscope"), Some(0));
        assert!(rows[0].is_null("embryo_number"));
        assert_eq!(rows[1].int("embryo_number"), Some(2));
        assert_eq!(rows[1].text("extraction_timestamp").as_deref(), Some("2024-01-01 00:00:00"));
    }
}
