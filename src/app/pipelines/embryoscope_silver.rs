//! bronze_raw_* → silver_*，每個診所 DB 各自重建

use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::config::lake_config::LakeConfig;
use crate::core::casting::to_date_value;
use crate::core::etl::blocking;
use crate::core::features::add_year_of_birth;
use crate::core::flatten::{
    annotation_names, cast_embryo_types, drop_sparse_columns, embryo_date, embryo_date_regex,
    flatten_embryo, order_embryo_columns, rename_embryo_columns, rename_idascore,
    IDASCORE_COLUMNS, META_COLUMNS,
};
use crate::core::matching::{match_prontuarios, ClinisysPatient, MatchSummary, UNMATCHED};
use crate::core::patient_id::clean_patient_id;
use crate::domain::model::{value_to_text, Record, StageContext, StageReport, Table};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 永遠不會被稀疏欄位過濾掉的欄位
const PROTECTED_COLUMNS: [&str; 9] = [
    "PatientIDx",
    "PatientID",
    "TreatmentName",
    "EmbryoID",
    "prontuario",
    "_extraction_timestamp",
    "_location",
    "_run_id",
    "_row_hash",
];

/// 一筆 bronze 原始物件與它的中繼欄位
struct RawObject {
    value: Value,
    meta: Record,
}

#[derive(Debug, Clone, Default)]
pub struct SilverSummary {
    pub location: String,
    pub rows: BTreeMap<String, usize>,
    pub matching: Option<MatchSummary>,
}

fn read_raw(db: &LakeDb, data_type: &str) -> Result<Vec<RawObject>> {
    let table = format!("bronze_raw_{}", data_type);
    if !db.table_exists(&table)? {
        tracing::warn!("⚠️ {} not found, nothing to transform", table);
        return Ok(Vec::new());
    }

    let rows = db.query_records(
        &format!(
            "SELECT raw_json, _extraction_timestamp, _location, _run_id, _row_hash FROM {}",
            quote_ident(&table)
        ),
        &[],
    )?;

    let mut objects = Vec::new();
    for row in rows {
        let Some(raw) = row.text("raw_json") else {
            continue;
        };
        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("⚠️ Skipping unparseable raw_json in {}: {}", table, e);
                continue;
            }
        };
        let meta = Record::from_pairs(
            META_COLUMNS
                .iter()
                .map(|c| (c.to_string(), row.get(c).cloned().unwrap_or(Value::Null))),
        );
        match parsed {
            Value::Array(items) => objects.extend(items.into_iter().map(|value| RawObject {
                value,
                meta: meta.clone(),
            })),
            value => objects.push(RawObject { value, meta }),
        }
    }
    Ok(objects)
}

fn with_meta(mut record: Record, meta: &Record) -> Record {
    for (k, v) in &meta.data {
        record.insert(k.clone(), v.clone());
    }
    record
}

fn stringify(record: Record) -> Record {
    Record::from_pairs(record.data.into_iter().map(|(k, v)| {
        let v = if k.starts_with('_') {
            v
        } else {
            value_to_text(&v).map(Value::String).unwrap_or(Value::Null)
        };
        (k, v)
    }))
}

/// PatientID 正規化；無效者移除並記錄
fn clean_patient_ids(rows: Vec<Record>, location: &str, what: &str) -> Vec<Record> {
    let mut invalid = BTreeSet::new();
    let mut kept = Vec::with_capacity(rows.len());
    for mut row in rows {
        let Some(raw) = row.get("PatientID").cloned() else {
            kept.push(row);
            continue;
        };
        match clean_patient_id(&raw) {
            Some(id) => {
                row.insert("PatientID", Value::from(id));
                kept.push(row);
            }
            None => {
                invalid.insert(value_to_text(&raw).unwrap_or_else(|| "null".to_string()));
            }
        }
    }
    if !invalid.is_empty() {
        let sample: Vec<&String> = invalid.iter().take(10).collect();
        tracing::warn!(
            "⚠️ [{}] {}: removed rows with {} invalid PatientID values: {:?}",
            location,
            what,
            invalid.len(),
            sample
        );
    }
    kept
}

fn load_clinisys_patients(clinisys_db: &Path) -> Result<Option<Vec<ClinisysPatient>>> {
    if !clinisys_db.exists() {
        return Ok(None);
    }
    let db = LakeDb::open(clinisys_db)?;
    if !db.table_exists("silver_view_pacientes")? {
        return Ok(None);
    }
    let table = db.read_table("silver_view_pacientes")?;
    Ok(Some(
        table.rows.iter().filter_map(ClinisysPatient::from_record).collect(),
    ))
}

fn build_patients(
    raw: Vec<RawObject>,
    location: &str,
    clinisys: Option<&[ClinisysPatient]>,
) -> (Table, Option<MatchSummary>) {
    let rows: Vec<Record> = raw
        .into_iter()
        .map(|r| {
            let mut record = flatten_embryo(&r.value, &BTreeSet::new());
            if let Some(dob) = record.get("DateOfBirth").cloned() {
                record.insert("DateOfBirth", to_date_value(&dob));
            }
            with_meta(record, &r.meta)
        })
        .collect();

    let mut rows = clean_patient_ids(rows, location, "patients");
    for row in rows.iter_mut() {
        row.insert("prontuario", Value::from(UNMATCHED));
    }

    let summary = match clinisys {
        Some(clinisys) => {
            let summary = match_prontuarios(&mut rows, clinisys);
            summary.log(location);
            Some(summary)
        }
        None => {
            tracing::warn!(
                "⚠️ [{}] silver_view_pacientes not available, prontuario stays {}",
                location,
                UNMATCHED
            );
            None
        }
    };

    let mut table = Table::from_records("silver_patients", rows);
    add_year_of_birth(&mut table);
    (table, summary)
}

fn build_treatments(raw: Vec<RawObject>) -> Table {
    let rows = raw
        .into_iter()
        .filter_map(|r| Record::from_json_object(&r.value).map(|rec| with_meta(stringify(rec), &r.meta)))
        .collect();
    Table::from_records("silver_treatments", rows)
}

fn build_idascore(raw: Vec<RawObject>) -> Table {
    if raw.is_empty() {
        let columns = IDASCORE_COLUMNS
            .iter()
            .chain(META_COLUMNS.iter())
            .map(|c| c.to_string())
            .collect();
        return Table::new("silver_idascore", columns);
    }
    let rows = raw
        .into_iter()
        .map(|r| with_meta(stringify(rename_idascore(&r.value)), &r.meta))
        .collect();
    Table::from_records("silver_idascore", rows)
}

fn build_embryo_data(raw: Vec<RawObject>, location: &str) -> Result<Table> {
    let names = annotation_names(raw.iter().map(|r| &r.value));
    let date_pattern = embryo_date_regex().map_err(|e| EtlError::ProcessingError {
        message: format!("Invalid EmbryoDate pattern: {}", e),
    })?;

    let rows: Vec<Record> = raw
        .iter()
        .map(|r| {
            let mut record = flatten_embryo(&r.value, &names);
            cast_embryo_types(&mut record);
            rename_embryo_columns(&mut record);
            let date = record
                .text("EmbryoID")
                .and_then(|id| embryo_date(&id, &date_pattern))
                .map(Value::String)
                .unwrap_or(Value::Null);
            record.insert("EmbryoDate", date);
            with_meta(record, &r.meta)
        })
        .collect();

    let rows = clean_patient_ids(rows, location, "embryo_data");
    let mut table = Table::from_records("silver_embryo_data", rows);
    table.columns = order_embryo_columns(&table.columns);
    tracing::info!(
        "🔄 [{}] embryo_data flattened with {} annotation types",
        location,
        names.len()
    );
    Ok(table)
}

fn filter_sparse(table: &mut Table, threshold: f64, location: &str) {
    let dropped = drop_sparse_columns(table, threshold, &PROTECTED_COLUMNS);
    if dropped.is_empty() {
        return;
    }
    tracing::info!(
        "🔄 [{}] {}: dropped {} columns above {:.1}% nulls",
        location,
        table.name,
        dropped.len(),
        threshold
    );
    for (column, rate) in &dropped {
        tracing::debug!("   {} ({:.1}% null)", column, rate);
    }
}

/// 單一診所 DB 的 bronze → silver
pub fn transform_clinic(
    db_path: &Path,
    location: &str,
    clinisys_db: &Path,
    null_rate_threshold: f64,
) -> Result<SilverSummary> {
    let db = LakeDb::open(db_path)?;
    let clinisys = load_clinisys_patients(clinisys_db)?;

    let (patients, matching) = build_patients(read_raw(&db, "patients")?, location, clinisys.as_deref());
    let treatments = build_treatments(read_raw(&db, "treatments")?);
    let idascore = build_idascore(read_raw(&db, "idascore")?);
    let embryo_data = build_embryo_data(read_raw(&db, "embryo_data")?, location)?;

    let mut summary = SilverSummary {
        location: location.to_string(),
        matching,
        ..SilverSummary::default()
    };

    for mut table in [patients, treatments, embryo_data, idascore] {
        filter_sparse(&mut table, null_rate_threshold, location);
        if table.columns.is_empty() {
            tracing::warn!("⚠️ [{}] {} has no data, not written", location, table.name);
            continue;
        }
        let written = db.replace_table(&table)?;
        tracing::info!("💾 [{}] {}: {} rows", location, table.name, written);
        summary.rows.insert(table.name.clone(), written);
    }
    Ok(summary)
}

/// `embryoscope-silver` 階段
pub struct EmbryoscopeSilverStage {
    config: Arc<LakeConfig>,
    clinic: Option<String>,
}

impl EmbryoscopeSilverStage {
    pub fn new(config: Arc<LakeConfig>, clinic: Option<String>) -> Self {
        Self { config, clinic }
    }

    fn targets(&self) -> Vec<(String, PathBuf)> {
        let names: Vec<String> = match &self.clinic {
            Some(name) => vec![self
                .config
                .clinic(name)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| name.clone())],
            None => self.config.enabled_clinics().map(|c| c.name.clone()).collect(),
        };
        names
            .into_iter()
            .map(|n| {
                let path = self.config.lake.clinic_db_path(&n);
                (n, path)
            })
            .collect()
    }
}

#[async_trait]
impl Stage for EmbryoscopeSilverStage {
    fn name(&self) -> &str {
        "embryoscope-silver"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let mut report = StageReport::new(self.name());
        let mut status = serde_json::Map::new();
        let threshold = self.config.silver.null_rate_threshold;
        let clinisys_db = self.config.lake.clinisys_db_path();

        for (location, path) in self.targets() {
            if !path.exists() {
                tracing::warn!("⚠️ [{}] Database {} not found, skipping", location, path.display());
                status.insert(location, Value::Bool(false));
                continue;
            }

            let (loc, db_path, cdb) = (location.clone(), path.clone(), clinisys_db.clone());
            match blocking(move || transform_clinic(&db_path, &loc, &cdb, threshold)).await {
                Ok(summary) => {
                    report.rows_written += summary.rows.values().sum::<usize>();
                    report.outputs.push(path.display().to_string());
                    if let Some(m) = &summary.matching {
                        report.metadata.insert(
                            format!("{}_match_rate", location),
                            serde_json::json!(m.match_rate()),
                        );
                    }
                    status.insert(location, Value::Bool(true));
                }
                Err(e) => {
                    tracing::error!("❌ [{}] Silver transformation failed: {}", location, e);
                    status.insert(location, Value::Bool(false));
                }
            }
        }

        let ok = status.values().filter(|v| v.as_bool() == Some(true)).count();
        tracing::info!("📊 {}/{} locations transformed", ok, status.len());
        report.tables = ["silver_patients", "silver_treatments", "silver_embryo_data", "silver_idascore"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        report.metadata.insert("locations".to_string(), Value::Object(status));

        if ok == 0 {
            return Err(EtlError::ProcessingError {
                message: "No Embryoscope database was transformed".to_string(),
            });
        }
        Ok(report)
    }
}
