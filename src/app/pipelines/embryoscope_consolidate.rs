//! 各診所 silver_* → 中央 DB 的 silver_embryoscope_*

use crate::adapters::lake_db::LakeDb;
use crate::config::lake_config::LakeConfig;
use crate::core::etl::blocking;
use crate::core::features::assign_embryo_numbers;
use crate::core::text::title_case;
use crate::domain::model::{Record, StageContext, StageReport, Table};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// (資料表, 業務鍵)
pub const CONSOLIDATED_TABLES: [(&str, &[&str]); 4] = [
    ("patients", &["PatientIDx"]),
    ("treatments", &["PatientIDx", "TreatmentName"]),
    ("embryo_data", &["EmbryoID"]),
    ("idascore", &["EmbryoID"]),
];

/// `embryoscope_*.db`，排除測試檔與中央 DB
pub fn discover_clinic_dbs(root: &Path, central_db: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.starts_with("embryoscope_")
            || !file_name.ends_with(".db")
            || file_name.contains("test")
            || path == central_db
        {
            continue;
        }
        let stem = file_name
            .trim_end_matches(".db")
            .trim_start_matches("embryoscope_");
        found.push((title_case(stem), path));
    }
    found.sort();
    Ok(found)
}

/// 空值鍵彼此視為相同
fn key_of(row: &Record, keys: &[&str]) -> Vec<Option<String>> {
    keys.iter().map(|k| row.text(k)).collect()
}

fn compare_nullable(a: Option<String>, b: Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// 每個業務鍵保留 `_extraction_timestamp` 最新的一列
pub fn dedup_latest(table: &mut Table, keys: &[&str]) -> usize {
    let before = table.rows.len();
    table.rows.sort_by(|a, b| {
        for k in keys {
            let ord = compare_nullable(a.text(k), b.text(k));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        compare_nullable(b.text("_extraction_timestamp"), a.text("_extraction_timestamp"))
    });

    let mut seen = HashSet::new();
    table.rows.retain(|row| seen.insert(key_of(row, keys)));
    before - table.rows.len()
}

/// 合併單一資料表；回傳寫入筆數
fn consolidate_table(
    central: &LakeDb,
    clinics: &[(String, PathBuf)],
    data_type: &str,
    keys: &[&str],
) -> Result<usize> {
    let source = format!("silver_{}", data_type);
    let mut combined = Table::new(format!("silver_embryoscope_{}", data_type), Vec::new());

    for (clinic, path) in clinics {
        let db = LakeDb::open(path)?;
        if !db.table_exists(&source)? {
            tracing::warn!("⚠️ [{}] {} not found, skipping", clinic, source);
            continue;
        }
        let table = db.read_table(&source)?;
        tracing::info!("📥 [{}] {}: {} rows", clinic, source, table.len());
        for column in &table.columns {
            combined.ensure_column(column);
        }
        for mut row in table.rows {
            row.insert("unit_huntington", Value::from(clinic.clone()));
            combined.rows.push(row);
        }
    }

    if combined.rows.is_empty() {
        tracing::warn!("⚠️ No rows for {}, table not written", combined.name);
        return Ok(0);
    }
    combined.ensure_column("unit_huntington");

    let removed = dedup_latest(&mut combined, keys);
    if removed > 0 {
        tracing::info!("🔄 {}: removed {} duplicated rows", combined.name, removed);
    }
    if data_type == "embryo_data" {
        assign_embryo_numbers(&mut combined);
    }

    let written = central.replace_table(&combined)?;
    tracing::info!("💾 {}: {} rows", combined.name, written);
    Ok(written)
}

pub fn consolidate(clinics: &[(String, PathBuf)], central_db: &Path) -> Result<BTreeMap<String, usize>> {
    let central = LakeDb::open(central_db)?;
    let mut written = BTreeMap::new();
    for (data_type, keys) in CONSOLIDATED_TABLES {
        let n = consolidate_table(&central, clinics, data_type, keys)?;
        written.insert(format!("silver_embryoscope_{}", data_type), n);
    }
    Ok(written)
}

/// `consolidate` 階段
pub struct EmbryoscopeConsolidateStage {
    config: Arc<LakeConfig>,
}

impl EmbryoscopeConsolidateStage {
    pub fn new(config: Arc<LakeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for EmbryoscopeConsolidateStage {
    fn name(&self) -> &str {
        "consolidate"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let root = self.config.lake.root_path();
        let central = self.config.lake.central_db_path();
        let clinics = discover_clinic_dbs(&root, &central)?;
        if clinics.is_empty() {
            return Err(EtlError::ProcessingError {
                message: format!("No embryoscope_*.db found under {}", root.display()),
            });
        }
        tracing::info!(
            "📊 Consolidating {} clinics: {}",
            clinics.len(),
            clinics.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", ")
        );

        let central_path = central.clone();
        let written = blocking(move || consolidate(&clinics, &central_path)).await?;

        let mut report = StageReport::new(self.name());
        report.rows_written = written.values().sum();
        report.tables = written.keys().cloned().collect();
        report.outputs.push(central.display().to_string());
        for (table, n) in written {
            report.metadata.insert(table, Value::from(n));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_discover_skips_test_and_central() {
        let dir = TempDir::new().unwrap();
        for name in [
            "embryoscope_sao_paulo.db",
            "embryoscope_ibirapuera.db",
            "embryoscope_test.db",
            "embryoscope_central.db",
            "clinisys_all.db",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = discover_clinic_dbs(dir.path(), &dir.path().join("embryoscope_central.db")).unwrap();
        let names: Vec<&str> = found.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Ibirapuera", "Sao Paulo"]);
    }

    #[test]
    fn test_dedup_keeps_latest_extraction() {
        let mut table = Table::from_records(
            "t",
            vec![
                Record::from_pairs([("PatientIDx", json!("A")), ("_extraction_timestamp", json!("2024-01-01 00:00:00")), ("v", json!(1))]),
                Record::from_pairs([("PatientIDx", json!("A")), ("_extraction_timestamp", json!("2024-02-01 00:00:00")), ("v", json!(2))]),
                Record::from_pairs([("PatientIDx", json!("B")), ("_extraction_timestamp", json!("2024-01-01 00:00:00")), ("v", json!(3))]),
            ],
        );
        assert_eq!(dedup_latest(&mut table, &["PatientIDx"]), 1);
        assert_eq!(table.rows[0].int("v"), Some(2));
        assert_eq!(table.rows[1].int("v"), Some(3));
    }

    #[test]
    fn test_dedup_collapses_null_keys() {
        let mut table = Table::from_records(
            "t",
            vec![
                Record::from_pairs([("EmbryoID", Value::Null), ("_extraction_timestamp", json!("2024-01-01 00:00:00")), ("v", json!(1))]),
                Record::from_pairs([("EmbryoID", Value::Null), ("_extraction_timestamp", json!("2024-03-01 00:00:00")), ("v", json!(2))]),
                Record::from_pairs([("EmbryoID", json!("E1")), ("_extraction_timestamp", json!("2024-01-01 00:00:00")), ("v", json!(3))]),
            ],
        );
        assert_eq!(dedup_latest(&mut table, &["EmbryoID"]), 1);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].int("v"), Some(3));
        assert_eq!(table.rows[1].int("v"), Some(2));
    }

    #[test]
    fn test_consolidate_unions_clinics() {
        let dir = TempDir::new().unwrap();
        let mut clinics = Vec::new();
        for (name, embryo) in [("Ibirapuera", "E1"), ("Vila Mariana", "E2")] {
            let path = dir.path().join(format!("embryoscope_{}.db", crate::core::text::clinic_slug(name)));
            let db = LakeDb::open(&path).unwrap();
            db.replace_table(&Table::from_records(
                "silver_embryo_data",
                vec![Record::from_pairs([
                    ("EmbryoID", json!(embryo)),
                    ("PatientIDx", json!("P")),
                    ("TreatmentName", json!("T")),
                    ("WellNumber", json!("1")),
                    ("_extraction_timestamp", json!("2024-01-01 00:00:00")),
                ])],
            ))
            .unwrap();
            clinics.push((name.to_string(), path));
        }

        let central = dir.path().join("central.db");
        let written = consolidate(&clinics, &central).unwrap();
        assert_eq!(written["silver_embryoscope_embryo_data"], 2);
        assert_eq!(written["silver_embryoscope_patients"], 0);

        let db = LakeDb::open(&central).unwrap();
        let rows = db
            .query_records(
                "SELECT unit_huntington, embryo_number FROM silver_embryoscope_embryo_data ORDER BY EmbryoID",
                &[],
            )
            .unwrap();
        assert_eq!(rows[0].text("unit_huntington").as_deref(), Some("Ibirapuera"));
        assert_eq!(rows[1].text("unit_huntington").as_deref(), Some("Vila Mariana"));
        assert_eq!(rows[0].int("embryo_number"), Some(1));
        assert!(!db.table_exists("silver_embryoscope_patients").unwrap());
    }
}
