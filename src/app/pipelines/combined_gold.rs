//! gold_clinisys_embrioes ⋈ gold_embryoscope_embrioes

use crate::adapters::lake_db::LakeDb;
use crate::app::pipelines::clinisys_gold::GOLD_CLINISYS;
use crate::app::pipelines::embryoscope_gold::GOLD_EMBRYOSCOPE;
use crate::config::lake_config::{CombineSettings, LakeConfig};
use crate::core::etl::blocking;
use crate::domain::model::{StageContext, StageReport};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub const GOLD_COMBINED: &str = "gold_embryoscope_clinisys_combined";

const PATIENT_KEY: &str = "COALESCE(NULLIF(e.prontuario, -1), e.patient_PatientID)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Left,
    Full,
}

impl JoinType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            "left" => Ok(JoinType::Left),
            "full" | "full outer" => Ok(JoinType::Full),
            other => Err(EtlError::InvalidConfigValueError {
                field: "combine.join_type".to_string(),
                value: other.to_string(),
                reason: "Expected left or full".to_string(),
            }),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            JoinType::Left => "LEFT JOIN",
            JoinType::Full => "FULL OUTER JOIN",
        }
    }
}

/// 合併結果統計
#[derive(Debug, Clone, Default, Serialize)]
pub struct JoinStatistics {
    pub strategy: String,
    pub tolerance_days: i64,
    pub total_rows: usize,
    pub flagged_embryos: usize,
    pub matched_rows: usize,
    pub match_rate: f64,
    pub clinisys_only: Option<usize>,
    pub embryoscope_only: Option<usize>,
}

impl JoinStatistics {
    pub fn log(&self) {
        tracing::info!(
            "📊 Combined join ({}, tolerance {} days): {} rows",
            self.strategy,
            self.tolerance_days,
            self.total_rows
        );
        tracing::info!(
            "📊   flagged clinisys embryos={}, matched={}, match rate={:.2}%",
            self.flagged_embryos,
            self.matched_rows,
            self.match_rate
        );
        if let (Some(c), Some(e)) = (self.clinisys_only, self.embryoscope_only) {
            tracing::info!("📊   clinisys only={}, embryoscope only={}", c, e);
        }
    }
}

fn date_condition(tolerance_days: i64) -> String {
    if tolerance_days == 0 {
        "date(c.micro_Data_DL) = date(e.embryo_FertilizationTime)".to_string()
    } else {
        format!(
            "abs(julianday(date(c.micro_Data_DL)) - julianday(date(e.embryo_FertilizationTime))) <= {}",
            tolerance_days
        )
    }
}

fn join_condition(tolerance_days: i64) -> String {
    format!(
        "{date}\n   AND c.oocito_embryo_number = e.embryo_embryo_number\n   AND c.micro_prontuario = {key}\n   AND {key} IS NOT NULL\n   AND c.oocito_flag_embryoscope = 1",
        date = date_condition(tolerance_days),
        key = PATIENT_KEY
    )
}

fn embryoscope_source() -> String {
    format!(
        "(SELECT * FROM {} WHERE embryo_EmbryoID IS NOT NULL)",
        GOLD_EMBRYOSCOPE
    )
}

pub fn combined_sql(join_type: JoinType, tolerance_days: i64) -> String {
    format!(
        "SELECT c.*, e.*\nFROM {} c\n{} {} e\n  ON {}",
        GOLD_CLINISYS,
        join_type.sql(),
        embryoscope_source(),
        join_condition(tolerance_days)
    )
}

fn count(db: &LakeDb, sql: &str) -> Result<usize> {
    Ok(db.scalar_i64(sql, &[])?.unwrap_or(0).max(0) as usize)
}

fn count_matches(db: &LakeDb, tolerance_days: i64) -> Result<usize> {
    count(
        db,
        &format!(
            "SELECT COUNT(*) FROM {} c JOIN {} e ON {}",
            GOLD_CLINISYS,
            embryoscope_source(),
            join_condition(tolerance_days)
        ),
    )
}

/// 依策略決定日期容許天數
pub fn choose_tolerance(db: &LakeDb, settings: &CombineSettings) -> Result<i64> {
    match settings.strategy.as_str() {
        "exact" => Ok(0),
        "tolerance" => Ok(settings.tolerance_days.max(0)),
        "best" => {
            let mut best = (0, count_matches(db, 0)?);
            tracing::info!("🔄 Candidate tolerance 0 days: {} matches", best.1);
            for days in 1..=settings.tolerance_days.max(0) {
                let matches = count_matches(db, days)?;
                tracing::info!("🔄 Candidate tolerance {} days: {} matches", days, matches);
                if matches > best.1 {
                    best = (days, matches);
                }
            }
            Ok(best.0)
        }
        other => Err(EtlError::InvalidConfigValueError {
            field: "combine.strategy".to_string(),
            value: other.to_string(),
            reason: "Expected exact, tolerance or best".to_string(),
        }),
    }
}

pub fn build_combined(central_db: &Path, settings: &CombineSettings) -> Result<JoinStatistics> {
    let db = LakeDb::open(central_db)?;
    for table in [GOLD_CLINISYS, GOLD_EMBRYOSCOPE] {
        if !db.table_exists(table)? {
            return Err(EtlError::ProcessingError {
                message: format!("{} not found", table),
            });
        }
    }

    let join_type = JoinType::parse(&settings.join_type)?;
    let tolerance = choose_tolerance(&db, settings)?;
    let sql = combined_sql(join_type, tolerance);
    tracing::debug!("Combined SQL:\n{}", sql);
    db.execute_batch(&format!(
        "DROP TABLE IF EXISTS {t};\nCREATE TABLE {t} AS {sql};",
        t = GOLD_COMBINED,
        sql = sql
    ))?;

    let total_rows = db.count(GOLD_COMBINED)?;
    let flagged_embryos = count(
        &db,
        &format!("SELECT COUNT(*) FROM {} WHERE oocito_flag_embryoscope = 1", GOLD_CLINISYS),
    )?;
    let matched_rows = count(
        &db,
        &format!(
            "SELECT COUNT(*) FROM {} WHERE oocito_id IS NOT NULL AND embryo_EmbryoID IS NOT NULL",
            GOLD_COMBINED
        ),
    )?;
    let (clinisys_only, embryoscope_only) = match join_type {
        JoinType::Left => (None, None),
        JoinType::Full => (
            Some(count(
                &db,
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE oocito_id IS NOT NULL AND embryo_EmbryoID IS NULL",
                    GOLD_COMBINED
                ),
            )?),
            Some(count(
                &db,
                &format!("SELECT COUNT(*) FROM {} WHERE oocito_id IS NULL", GOLD_COMBINED),
            )?),
        ),
    };

    let stats = JoinStatistics {
        strategy: settings.strategy.clone(),
        tolerance_days: tolerance,
        total_rows,
        flagged_embryos,
        matched_rows,
        match_rate: if flagged_embryos == 0 {
            0.0
        } else {
            matched_rows as f64 * 100.0 / flagged_embryos as f64
        },
        clinisys_only,
        embryoscope_only,
    };
    stats.log();
    Ok(stats)
}

/// `combine` 階段
pub struct CombinedGoldStage {
    config: Arc<LakeConfig>,
}

impl CombinedGoldStage {
    pub fn new(config: Arc<LakeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for CombinedGoldStage {
    fn name(&self) -> &str {
        "combine"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let central = self.config.lake.central_db_path();
        let settings = self.config.combine.clone();
        let path = central.clone();
        let stats = blocking(move || build_combined(&path, &settings)).await?;

        let mut report = StageReport::new(self.name());
        report.rows_written = stats.total_rows;
        report.tables.push(GOLD_COMBINED.to_string());
        report.outputs.push(central.display().to_string());
        report
            .metadata
            .insert("join_statistics".to_string(), serde_json::to_value(&stats)?);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Record, Table};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn seed(path: &Path) {
        let db = LakeDb::open(path).unwrap();
        db.replace_table(&Table::from_records(
            GOLD_CLINISYS,
            vec![
                Record::from_pairs([
                    ("oocito_id", json!(1)),
                    ("oocito_embryo_number", json!(1)),
                    ("oocito_flag_embryoscope", json!(1)),
                    ("micro_prontuario", json!(100)),
                    ("micro_Data_DL", json!("2024-01-10")),
                ]),
                Record::from_pairs([
                    ("oocito_id", json!(2)),
                    ("oocito_embryo_number", Value::Null),
                    ("oocito_flag_embryoscope", json!(0)),
                    ("micro_prontuario", json!(100)),
                    ("micro_Data_DL", json!("2024-01-10")),
                ]),
            ],
        ))
        .unwrap();
        db.replace_table(&Table::from_records(
            GOLD_EMBRYOSCOPE,
            vec![
                Record::from_pairs([
                    ("prontuario", json!(-1)),
                    ("patient_PatientID", json!(100)),
                    ("embryo_EmbryoID", json!("E1")),
                    ("embryo_embryo_number", json!(1)),
                    ("embryo_FertilizationTime", json!("2024-01-11 09:00:00")),
                ]),
                Record::from_pairs([
                    ("prontuario", json!(555)),
                    ("patient_PatientID", json!(555)),
                    ("embryo_EmbryoID", json!("E9")),
                    ("embryo_embryo_number", json!(1)),
                    ("embryo_FertilizationTime", json!("2024-03-01 09:00:00")),
                ]),
            ],
        ))
        .unwrap();
    }

    #[test]
    fn test_exact_strategy_misses_next_day_fertilization() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("central.db");
        seed(&path);
        let settings = CombineSettings {
            strategy: "exact".to_string(),
            ..CombineSettings::default()
        };
        let stats = build_combined(&path, &settings).unwrap();
        assert_eq!(stats.tolerance_days, 0);
        assert_eq!(stats.total_rows, 2);
        assert_eq!(stats.matched_rows, 0);
        assert_eq!(stats.flagged_embryos, 1);
    }

    #[test]
    fn test_best_strategy_picks_tolerance_with_most_matches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("central.db");
        seed(&path);
        let stats = build_combined(&path, &CombineSettings::default()).unwrap();
        assert_eq!(stats.tolerance_days, 1);
        assert_eq!(stats.matched_rows, 1);
        assert!((stats.match_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_join_counts_unmatched_sides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("central.db");
        seed(&path);
        let settings = CombineSettings {
            join_type: "full".to_string(),
            ..CombineSettings::default()
        };
        let stats = build_combined(&path, &settings).unwrap();
        assert_eq!(stats.total_rows, 3);
        assert_eq!(stats.clinisys_only, Some(1));
        assert_eq!(stats.embryoscope_only, Some(1));
    }
}
