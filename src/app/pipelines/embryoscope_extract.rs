//! Embryoscope API → 每個診所自己的 DB (bronze_raw_* + data_*)，增量寫入

use crate::adapters::embryoscope_client::EmbryoscopeClient;
use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::config::lake_config::{ExtractionSettings, LakeConfig};
use crate::core::etl::blocking;
use crate::core::hashing::{data_hash, row_hash};
use crate::domain::model::{value_to_text, Record, StageContext, StageReport};
use crate::domain::ports::{EmbryoscopeApi, Stage};
use crate::utils::error::{EtlError, Result};
use crate::utils::progress::fetch_bar;
use async_trait::async_trait;
use indicatif::ProgressBar;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DATA_TYPES: [&str; 4] = ["patients", "treatments", "embryo_data", "idascore"];

const EXTRACTION_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// 單一診所一次萃取的結果
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub location: String,
    pub run_id: String,
    pub fetched: BTreeMap<String, usize>,
    pub inserted: BTreeMap<String, usize>,
    pub new_pairs: usize,
}

impl ExtractionOutcome {
    pub fn total_inserted(&self) -> usize {
        self.inserted.values().sum()
    }

    pub fn total_fetched(&self) -> usize {
        self.fetched.values().sum()
    }
}

/// 一次萃取中從 API 拿到的原始物件
#[derive(Debug, Default)]
struct RawBatch {
    patients: Vec<Value>,
    treatments: Vec<(String, String)>,
    embryos: Vec<Value>,
    scores: Vec<Value>,
}

pub fn list_under<'a>(body: &'a Value, root: &str) -> Vec<&'a Value> {
    match body.get(root) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single],
    }
}

pub fn patient_idx(patient: &Value) -> Option<String> {
    ["PatientIDx", "PatientIdx", "PatientID"]
        .iter()
        .find_map(|key| patient.get(*key))
        .and_then(value_to_text)
}

pub fn treatment_names(body: &Value) -> Vec<String> {
    list_under(body, "TreatmentList")
        .into_iter()
        .filter_map(value_to_text)
        .collect()
}

fn pair_key(patient_idx: &str, treatment: &str) -> String {
    format!("{}\u{1f}{}", patient_idx, treatment)
}

/// 頂層欄位；巢狀值轉成 JSON 文字
fn top_level_record(object: &Value) -> Record {
    let mut record = Record::new();
    if let Value::Object(map) = object {
        for (key, value) in map {
            let value = match value {
                Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                other => other.clone(),
            };
            record.insert(key.clone(), value);
        }
    }
    record
}

fn with_meta(mut record: Record, location: &str, timestamp: &str, run_id: &str) -> Record {
    let hash = row_hash(&record);
    record.insert("_location", Value::from(location));
    record.insert("_extraction_timestamp", Value::from(timestamp));
    record.insert("_run_id", Value::from(run_id));
    record.insert("_row_hash", Value::from(hash));
    record
}

fn raw_row(raw: &Value, keys: &[(&str, Option<String>)]) -> Record {
    let mut record = Record::new();
    record.insert("raw_json", Value::String(raw.to_string()));
    for (key, value) in keys {
        record.insert(*key, value.clone().map(Value::from).unwrap_or(Value::Null));
    }
    record
}

fn columns_of(rows: &[Record]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for key in row.data.keys() {
            if !key.starts_with('_') && seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }
    for meta in ["_location", "_extraction_timestamp", "_run_id", "_row_hash"] {
        columns.push(meta.to_string());
    }
    columns
}

/// 已有胚胎資料的 (PatientIDx, TreatmentName)；沒有資料的療程下次會重抓
fn stored_pairs(db: &LakeDb, location: &str) -> Result<HashSet<String>> {
    if !db.table_exists("data_embryo_data")? {
        return Ok(HashSet::new());
    }
    db.text_set(
        "SELECT DISTINCT PatientIDx || char(31) || TreatmentName FROM data_embryo_data WHERE _location = ?1",
        &[SqlValue::Text(location.to_string())],
    )
}

fn stored_hashes(db: &LakeDb, table: &str, location: &str) -> Result<HashSet<String>> {
    if !db.table_exists(table)? {
        return Ok(HashSet::new());
    }
    let sql = format!(
        "SELECT DISTINCT _row_hash FROM {} WHERE _location = ?1",
        quote_ident(table)
    );
    db.text_set(&sql, &[SqlValue::Text(location.to_string())])
}

fn save_bronze(db: &LakeDb, table: &str, rows: Vec<Record>) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let existing = match rows.first().and_then(|r| r.text("_location")) {
        Some(location) => stored_hashes(db, table, &location)?,
        None => HashSet::new(),
    };
    let fresh: Vec<Record> = rows
        .into_iter()
        .filter(|r| r.text("_row_hash").map(|h| !existing.contains(&h)).unwrap_or(true))
        .collect();
    let columns = columns_of(&fresh);
    db.append_rows(table, &columns, &fresh)
}

const VIEW_METADATA_DDL: &str = "CREATE TABLE IF NOT EXISTS view_metadata (
    view_name TEXT NOT NULL,
    location TEXT NOT NULL,
    last_extraction_timestamp TEXT,
    last_row_count INTEGER,
    last_data_hash TEXT,
    change_detection_method TEXT,
    extraction_strategy TEXT,
    batch_size INTEGER,
    parallel_processing INTEGER,
    updated_at TEXT,
    PRIMARY KEY (view_name, location)
);
CREATE TABLE IF NOT EXISTS incremental_runs (
    run_id TEXT PRIMARY KEY,
    location TEXT,
    extraction_timestamp TEXT,
    total_views INTEGER,
    incremental_extractions INTEGER,
    skipped_views INTEGER,
    total_rows_processed INTEGER,
    processing_time_seconds REAL,
    status TEXT
);";

/// data_* 增量寫入並更新 view_metadata
fn save_incremental(
    db: &LakeDb,
    frames: &BTreeMap<String, Vec<Record>>,
    location: &str,
    timestamp: &str,
    settings: &ExtractionSettings,
) -> Result<BTreeMap<String, usize>> {
    db.execute_batch(VIEW_METADATA_DDL)?;
    let mut inserted = BTreeMap::new();

    for (data_type, rows) in frames {
        let table = format!("data_{}", data_type);
        let existing = stored_hashes(db, &table, location)?;
        let fresh: Vec<Record> = rows
            .iter()
            .filter(|r| r.text("_row_hash").map(|h| !existing.contains(&h)).unwrap_or(true))
            .cloned()
            .collect();

        let count = if fresh.is_empty() {
            tracing::info!("⏭️ [{}] {}: no changes detected", location, data_type);
            0
        } else {
            let n = db.append_rows(&table, &columns_of(&fresh), &fresh)?;
            tracing::info!("💾 [{}] {}: inserted {} new rows", location, data_type, n);
            n
        };
        inserted.insert(data_type.clone(), count);

        let hash = data_hash(rows.iter().filter_map(|r| r.text("_row_hash")));
        db.execute(
            "INSERT OR REPLACE INTO view_metadata (view_name, location, last_extraction_timestamp, last_row_count, last_data_hash, change_detection_method, extraction_strategy, batch_size, parallel_processing, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, 'hash_based', 'incremental', ?6, ?7, ?8)",
            &[
                SqlValue::Text(data_type.clone()),
                SqlValue::Text(location.to_string()),
                SqlValue::Text(timestamp.to_string()),
                SqlValue::Integer(rows.len() as i64),
                SqlValue::Text(hash),
                SqlValue::Integer(settings.batch_size as i64),
                SqlValue::Integer(i64::from(settings.max_workers > 1)),
                SqlValue::Text(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
            ],
        )?;
    }
    Ok(inserted)
}

fn record_run(
    db: &LakeDb,
    run_id: &str,
    location: &str,
    timestamp: &str,
    inserted: &BTreeMap<String, usize>,
    seconds: f64,
    status: &str,
) -> Result<()> {
    db.execute_batch(VIEW_METADATA_DDL)?;
    let incremental = inserted.values().filter(|n| **n > 0).count();
    let total: usize = inserted.values().sum();
    db.execute(
        "INSERT OR REPLACE INTO incremental_runs VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        &[
            SqlValue::Text(run_id.to_string()),
            SqlValue::Text(location.to_string()),
            SqlValue::Text(timestamp.to_string()),
            SqlValue::Integer(DATA_TYPES.len() as i64),
            SqlValue::Integer(incremental as i64),
            SqlValue::Integer((DATA_TYPES.len() - incremental) as i64),
            SqlValue::Integer(total as i64),
            SqlValue::Real(seconds),
            SqlValue::Text(status.to_string()),
        ],
    )?;
    Ok(())
}

async fn fetch_treatments(
    api: &Arc<dyn EmbryoscopeApi>,
    patient_ids: &[String],
    settings: &ExtractionSettings,
    bar: &ProgressBar,
) -> Vec<(String, String)> {
    let location = api.location().to_string();
    let semaphore = Arc::new(Semaphore::new(settings.max_workers.max(1)));
    let mut pairs = Vec::new();

    for chunk in patient_ids.chunks(settings.token_refresh_patients.max(1)) {
        if let Err(e) = api.refresh_token().await {
            tracing::warn!("⚠️ [{}] Token refresh failed: {}", location, e);
        }

        let mut tasks = JoinSet::new();
        for idx in chunk {
            let api = api.clone();
            let semaphore = semaphore.clone();
            let idx = idx.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = api.get_treatments(&idx).await;
                (idx, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            bar.inc(1);
            match joined {
                Ok((idx, Ok(Some(body)))) => {
                    for name in treatment_names(&body) {
                        pairs.push((idx.clone(), name));
                    }
                }
                Ok((idx, Ok(None))) => {
                    tracing::debug!("[{}] No treatments for patient {}", location, idx)
                }
                Ok((idx, Err(e))) => {
                    tracing::warn!("⚠️ [{}] Treatments failed for patient {}: {}", location, idx, e)
                }
                Err(e) => tracing::warn!("⚠️ [{}] Treatment task aborted: {}", location, e),
            }
        }
    }

    pairs.sort();
    pairs
}

async fn fetch_embryo_data(
    api: &Arc<dyn EmbryoscopeApi>,
    pairs: &[(String, String)],
    ongoing: &HashSet<String>,
    settings: &ExtractionSettings,
    bar: &ProgressBar,
) -> Vec<Value> {
    let location = api.location().to_string();
    let semaphore = Arc::new(Semaphore::new(settings.max_workers.max(1)));
    let mut embryos: Vec<(String, String, usize, Value)> = Vec::new();

    for chunk in pairs.chunks(settings.token_refresh_treatments.max(1)) {
        if let Err(e) = api.refresh_token().await {
            tracing::warn!("⚠️ [{}] Token refresh failed: {}", location, e);
        }

        let mut tasks = JoinSet::new();
        for (idx, treatment) in chunk {
            let api = api.clone();
            let semaphore = semaphore.clone();
            let (idx, treatment) = (idx.clone(), treatment.clone());
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = api.get_embryo_data(&idx, &treatment).await;
                (idx, treatment, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            bar.inc(1);
            let (idx, treatment, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!("⚠️ [{}] Embryo task aborted: {}", location, e);
                    continue;
                }
            };
            let list = match result {
                Ok(Some(body)) => list_under(&body, "EmbryoDataList")
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>(),
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [{}] Embryo data failed for {}/{}: {}",
                        location,
                        idx,
                        treatment,
                        e
                    );
                    continue;
                }
            };

            if list.is_empty() {
                if ongoing.contains(&idx) {
                    tracing::debug!(
                        "[{}] No embryo data yet for ongoing patient {} / {} (will retry in future runs)",
                        location,
                        idx,
                        treatment
                    );
                } else {
                    tracing::warn!(
                        "⚠️ [{}] No embryo data for patient {} / {}",
                        location,
                        idx,
                        treatment
                    );
                }
                continue;
            }

            for (pos, mut embryo) in list.into_iter().enumerate() {
                if let Value::Object(map) = &mut embryo {
                    map.insert("PatientIDx".to_string(), Value::from(idx.clone()));
                    map.insert("TreatmentName".to_string(), Value::from(treatment.clone()));
                }
                embryos.push((idx.clone(), treatment.clone(), pos, embryo));
            }
        }
    }

    embryos.sort_by(|a, b| (&a.0, &a.1, a.2).cmp(&(&b.0, &b.1, b.2)));
    embryos.into_iter().map(|(_, _, _, e)| e).collect()
}

/// 單一診所的完整萃取
pub async fn extract_location(
    api: Arc<dyn EmbryoscopeApi>,
    db_path: PathBuf,
    settings: ExtractionSettings,
    only_patients: Option<Arc<BTreeSet<String>>>,
) -> Result<ExtractionOutcome> {
    let location = api.location().to_string();
    let run_id = uuid::Uuid::new_v4().to_string();
    let timestamp = chrono::Local::now().format(EXTRACTION_TS_FORMAT).to_string();
    let started = Instant::now();
    tracing::info!("🚀 [{}] Starting extraction (run {})", location, run_id);

    let mut batch = RawBatch::default();

    let patients_body = api.get_patients().await?.ok_or_else(|| EtlError::ProcessingError {
        message: format!("No patients data received for {}", location),
    })?;
    batch.patients = list_under(&patients_body, "Patients").into_iter().cloned().collect();
    if let Some(only) = &only_patients {
        batch
            .patients
            .retain(|p| patient_idx(p).map(|idx| only.contains(&idx)).unwrap_or(false));
        tracing::info!("🎯 [{}] Restricted to {} requested patients", location, only.len());
    }
    tracing::info!("📥 [{}] Patients: {}", location, batch.patients.len());

    let ongoing: HashSet<String> = match api.get_ongoing_patients().await {
        Ok(Some(body)) => list_under(&body, "Patients")
            .into_iter()
            .filter_map(patient_idx)
            .collect(),
        Ok(None) => HashSet::new(),
        Err(e) => {
            tracing::warn!("⚠️ [{}] Ongoing patients unavailable: {}", location, e);
            HashSet::new()
        }
    };
    tracing::info!("📥 [{}] Ongoing patients: {}", location, ongoing.len());

    let mut patient_ids: Vec<String> = batch.patients.iter().filter_map(patient_idx).collect();
    patient_ids.sort();
    patient_ids.dedup();

    let bar = fetch_bar(
        patient_ids.len(),
        format!("{} treatments", location),
        settings.show_progress,
    );
    batch.treatments = fetch_treatments(&api, &patient_ids, &settings, &bar).await;
    bar.finish_and_clear();
    tracing::info!("📥 [{}] Treatments: {}", location, batch.treatments.len());

    let stored = {
        let path = db_path.clone();
        let loc = location.clone();
        blocking(move || stored_pairs(&LakeDb::open(&path)?, &loc)).await?
    };
    let new_pairs: Vec<(String, String)> = batch
        .treatments
        .iter()
        .filter(|(idx, name)| !stored.contains(&pair_key(idx, name)))
        .cloned()
        .collect();
    tracing::info!(
        "🔄 [{}] New treatment pairs: {} (of {})",
        location,
        new_pairs.len(),
        batch.treatments.len()
    );

    let bar = fetch_bar(
        new_pairs.len(),
        format!("{} embryo data", location),
        settings.show_progress,
    );
    batch.embryos = fetch_embryo_data(&api, &new_pairs, &ongoing, &settings, &bar).await;
    bar.finish_and_clear();
    tracing::info!("📥 [{}] Embryos: {}", location, batch.embryos.len());

    batch.scores = match api.get_idascore().await {
        Ok(Some(body)) => list_under(&body, "Scores").into_iter().cloned().collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!("⚠️ [{}] IDAScore unavailable: {}", location, e);
            Vec::new()
        }
    };
    tracing::info!("📥 [{}] IDAScores: {}", location, batch.scores.len());

    let outcome = {
        let location = location.clone();
        let run_id = run_id.clone();
        let settings = settings.clone();
        blocking(move || {
            persist(&db_path, &batch, &location, &timestamp, &run_id, &settings, started)
        })
        .await?
    };

    tracing::info!(
        "✅ [{}] Extraction finished: {} rows inserted in {:.1}s",
        location,
        outcome.total_inserted(),
        started.elapsed().as_secs_f64()
    );
    Ok(ExtractionOutcome {
        new_pairs: new_pairs.len(),
        ..outcome
    })
}

fn persist(
    db_path: &Path,
    batch: &RawBatch,
    location: &str,
    timestamp: &str,
    run_id: &str,
    settings: &ExtractionSettings,
    started: Instant,
) -> Result<ExtractionOutcome> {
    let db = LakeDb::open(db_path)?;
    let meta = |r: Record| with_meta(r, location, timestamp, run_id);

    let bronze_patients: Vec<Record> = batch
        .patients
        .iter()
        .map(|p| meta(raw_row(p, &[("PatientIDx", patient_idx(p))])))
        .collect();
    let bronze_treatments: Vec<Record> = batch
        .treatments
        .iter()
        .map(|(idx, name)| {
            let raw = serde_json::json!({"PatientIDx": idx, "TreatmentName": name});
            meta(raw_row(
                &raw,
                &[("PatientIDx", Some(idx.clone())), ("TreatmentName", Some(name.clone()))],
            ))
        })
        .collect();
    let bronze_embryos: Vec<Record> = batch
        .embryos
        .iter()
        .map(|e| {
            meta(raw_row(
                e,
                &[
                    ("PatientIDx", e.get("PatientIDx").and_then(value_to_text)),
                    ("TreatmentName", e.get("TreatmentName").and_then(value_to_text)),
                ],
            ))
        })
        .collect();
    let bronze_scores: Vec<Record> = batch
        .scores
        .iter()
        .map(|s| {
            meta(raw_row(
                s,
                &[("EmbryoID", s.get("EmbryoID").and_then(value_to_text))],
            ))
        })
        .collect();

    save_bronze(&db, "bronze_raw_patients", bronze_patients)?;
    save_bronze(&db, "bronze_raw_treatments", bronze_treatments)?;
    save_bronze(&db, "bronze_raw_embryo_data", bronze_embryos)?;
    save_bronze(&db, "bronze_raw_idascore", bronze_scores)?;

    let mut frames: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    frames.insert(
        "patients".to_string(),
        batch.patients.iter().map(|p| meta(top_level_record(p))).collect(),
    );
    frames.insert(
        "treatments".to_string(),
        batch
            .treatments
            .iter()
            .map(|(idx, name)| {
                meta(Record::from_pairs([
                    ("PatientIDx", Value::from(idx.clone())),
                    ("TreatmentName", Value::from(name.clone())),
                ]))
            })
            .collect(),
    );
    frames.insert(
        "embryo_data".to_string(),
        batch.embryos.iter().map(|e| meta(top_level_record(e))).collect(),
    );
    frames.insert(
        "idascore".to_string(),
        batch.scores.iter().map(|s| meta(top_level_record(s))).collect(),
    );

    let fetched = frames
        .iter()
        .map(|(k, rows)| (k.clone(), rows.len()))
        .collect::<BTreeMap<_, _>>();

    let saved = save_incremental(&db, &frames, location, timestamp, settings);
    let seconds = started.elapsed().as_secs_f64();
    match saved {
        Ok(inserted) => {
            record_run(&db, run_id, location, timestamp, &inserted, seconds, "success")?;
            Ok(ExtractionOutcome {
                location: location.to_string(),
                run_id: run_id.to_string(),
                fetched,
                inserted,
                new_pairs: 0,
            })
        }
        Err(e) => {
            if let Err(log_err) =
                record_run(&db, run_id, location, timestamp, &BTreeMap::new(), seconds, "failed")
            {
                tracing::warn!("⚠️ [{}] Could not record failed run: {}", location, log_err);
            }
            Err(e)
        }
    }
}

/// `extract` 階段：所有啟用的診所，平行或依序
pub struct EmbryoscopeExtractStage {
    config: Arc<LakeConfig>,
    apis: Vec<Arc<dyn EmbryoscopeApi>>,
    rejected: Vec<String>,
    sequential: bool,
    patients: Option<Arc<BTreeSet<String>>>,
}

impl EmbryoscopeExtractStage {
    /// 依設定建立每個診所的 API 客戶端；`clinic` 限定單一診所
    pub fn new(config: Arc<LakeConfig>, clinic: Option<&str>, sequential: bool) -> Result<Self> {
        let mut apis: Vec<Arc<dyn EmbryoscopeApi>> = Vec::new();
        let mut rejected = Vec::new();

        match clinic {
            Some(name) => match config.clinic(name) {
                Some(c) if c.enabled => {
                    apis.push(Arc::new(EmbryoscopeClient::new(c, &config.extraction)?))
                }
                Some(_) => {
                    tracing::warn!("⚠️ Clinic {} is disabled", name);
                    rejected.push(name.to_string());
                }
                None => {
                    tracing::warn!("⚠️ Unknown clinic: {}", name);
                    rejected.push(name.to_string());
                }
            },
            None => {
                for c in config.enabled_clinics() {
                    apis.push(Arc::new(EmbryoscopeClient::new(c, &config.extraction)?));
                }
            }
        }

        Ok(Self {
            config,
            apis,
            rejected,
            sequential,
            patients: None,
        })
    }

    /// 直接給定 API 實作 (測試或自訂來源)
    pub fn with_apis(config: Arc<LakeConfig>, apis: Vec<Arc<dyn EmbryoscopeApi>>) -> Self {
        Self {
            config,
            apis,
            rejected: Vec::new(),
            sequential: false,
            patients: None,
        }
    }

    /// 只萃取指定的 PatientIDx；空清單表示全部
    pub fn with_patients(mut self, patients: Vec<String>) -> Self {
        self.patients = if patients.is_empty() {
            None
        } else {
            Some(Arc::new(patients.into_iter().collect()))
        };
        self
    }

    pub async fn run_locations(&self) -> BTreeMap<String, Result<ExtractionOutcome>> {
        let mut results = BTreeMap::new();
        for name in &self.rejected {
            results.insert(
                name.clone(),
                Err(EtlError::ConfigError {
                    message: format!("Clinic {} is unknown or disabled", name),
                }),
            );
        }

        let parallel = self.config.extraction.parallel_clinics && !self.sequential;
        if parallel {
            let mut tasks = JoinSet::new();
            for api in &self.apis {
                let api = api.clone();
                let path = self.config.lake.clinic_db_path(api.location());
                let settings = self.config.extraction.clone();
                let patients = self.patients.clone();
                tasks.spawn(async move {
                    let location = api.location().to_string();
                    (location, extract_location(api, path, settings, patients).await)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((location, outcome)) => {
                        results.insert(location, outcome);
                    }
                    Err(e) => tracing::error!("❌ Extraction task aborted: {}", e),
                }
            }
        } else {
            for api in &self.apis {
                let location = api.location().to_string();
                let path = self.config.lake.clinic_db_path(&location);
                let outcome = extract_location(
                    api.clone(),
                    path,
                    self.config.extraction.clone(),
                    self.patients.clone(),
                )
                .await;
                results.insert(location, outcome);
            }
        }
        results
    }
}

#[async_trait]
impl Stage for EmbryoscopeExtractStage {
    fn name(&self) -> &str {
        "extract"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let results = self.run_locations().await;
        let mut report = StageReport::new(self.name());
        let mut status = serde_json::Map::new();

        for (location, outcome) in &results {
            match outcome {
                Ok(o) => {
                    report.rows_read += o.total_fetched();
                    report.rows_written += o.total_inserted();
                    report
                        .outputs
                        .push(self.config.lake.clinic_db_path(location).display().to_string());
                    status.insert(location.clone(), Value::Bool(true));
                }
                Err(e) => {
                    tracing::error!("❌ [{}] Extraction failed: {}", location, e);
                    status.insert(location.clone(), Value::Bool(false));
                }
            }
        }

        let ok = status.values().filter(|v| v.as_bool() == Some(true)).count();
        tracing::info!("📊 {}/{} locations successful", ok, status.len());
        report.tables = DATA_TYPES.iter().map(|t| format!("data_{}", t)).collect();
        report.metadata.insert("locations".to_string(), Value::Object(status));

        if ok == 0 {
            return Err(EtlError::ProcessingError {
                message: "No location was extracted successfully".to_string(),
            });
        }
        Ok(report)
    }
}
