//! 中央 DB：silver_embryoscope_* → gold_embryoscope_embrioes

use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::config::lake_config::LakeConfig;
use crate::core::etl::blocking;
use crate::domain::model::{StageContext, StageReport};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

pub const GOLD_EMBRYOSCOPE: &str = "gold_embryoscope_embrioes";

const REGULAR_EMBRYO_COLUMNS: [&str; 15] = [
    "EmbryoID",
    "KIDDate",
    "KIDScore",
    "KIDUser",
    "KIDVersion",
    "Description",
    "EmbryoDescriptionID",
    "EmbryoFate",
    "FertilizationMethod",
    "FertilizationTime",
    "InstrumentNumber",
    "Position",
    "WellNumber",
    "embryo_number",
    "unit_huntington",
];

const ANNOTATION_PREFIXES: [&str; 4] = ["Name", "Time", "Timestamp", "Value"];

fn alias(name: &str) -> String {
    name.replace(['-', '+'], "_")
}

fn select_item(table_alias: &str, column: &str, output: &str) -> String {
    format!("{}.{} AS {}", table_alias, quote_ident(column), quote_ident(output))
}

/// `Timestamp_t2` → ("Timestamp", "t2")；最長前綴優先
fn split_annotation(column: &str) -> Option<(&'static str, &str)> {
    let mut prefixes = ANNOTATION_PREFIXES;
    prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
    prefixes.iter().find_map(|p| {
        column
            .strip_prefix(p)
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|rest| !rest.is_empty())
            .map(|rest| (*p, rest))
    })
}

/// 胚胎欄位排序：固定欄位、annotation 群組、其餘
pub fn embryo_select_items(columns: &[String]) -> Vec<String> {
    let present: BTreeSet<&str> = columns
        .iter()
        .map(String::as_str)
        .filter(|c| !c.starts_with('_'))
        .collect();
    let mut items = Vec::new();
    let mut used = BTreeSet::new();

    for column in REGULAR_EMBRYO_COLUMNS {
        if present.contains(column) {
            items.push(select_item("ed", column, &format!("embryo_{}", column)));
            used.insert(column.to_string());
        }
    }

    let types: BTreeSet<&str> = present
        .iter()
        .filter(|c| !used.contains(**c))
        .filter_map(|c| split_annotation(c).map(|(_, t)| t))
        .collect();
    for annotation in &types {
        for prefix in ANNOTATION_PREFIXES {
            let column = format!("{}_{}", prefix, annotation);
            if present.contains(column.as_str()) && used.insert(column.clone()) {
                items.push(select_item(
                    "ed",
                    &column,
                    &alias(&format!("embryo_{}_{}", prefix, annotation)),
                ));
            }
        }
    }

    for column in &present {
        if !used.contains(*column) {
            items.push(select_item("ed", column, &alias(&format!("embryo_{}", column))));
        }
    }
    items
}

pub fn build_gold_sql(patient_cols: &[String], treatment_cols: &[String], embryo_cols: &[String]) -> String {
    let mut items = Vec::new();
    for column in patient_cols.iter().filter(|c| !c.starts_with('_')) {
        let output = if column == "prontuario" {
            column.clone()
        } else {
            format!("patient_{}", column)
        };
        items.push(select_item("p", column, &alias(&output)));
    }
    for column in treatment_cols.iter().filter(|c| !c.starts_with('_')) {
        items.push(select_item("t", column, &alias(&format!("treatment_{}", column))));
    }
    items.extend(embryo_select_items(embryo_cols));

    format!(
        "SELECT {}\nFROM silver_embryoscope_patients p\n\
         LEFT JOIN silver_embryoscope_treatments t ON p.PatientIDx = t.PatientIDx\n\
         LEFT JOIN silver_embryoscope_embryo_data ed ON ed.PatientIDx = p.PatientIDx AND ed.TreatmentName = t.TreatmentName\n\
         WHERE ed.EmbryoID IS NOT NULL\n\
         ORDER BY p.PatientIDx DESC",
        items.join(",\n       ")
    )
}

pub fn build_embryoscope_gold(central_db: &Path) -> Result<usize> {
    let db = LakeDb::open(central_db)?;
    for table in [
        "silver_embryoscope_patients",
        "silver_embryoscope_treatments",
        "silver_embryoscope_embryo_data",
    ] {
        if !db.table_exists(table)? {
            return Err(EtlError::ProcessingError {
                message: format!("{} not found; run consolidate first", table),
            });
        }
    }

    let sql = build_gold_sql(
        &db.columns("silver_embryoscope_patients")?,
        &db.columns("silver_embryoscope_treatments")?,
        &db.columns("silver_embryoscope_embryo_data")?,
    );
    tracing::debug!("Gold SQL:\n{}", sql);

    db.execute_batch(&format!(
        "DROP TABLE IF EXISTS {gold};\nCREATE TABLE {gold} AS {sql};",
        gold = GOLD_EMBRYOSCOPE,
        sql = sql
    ))?;
    let rows = db.count(GOLD_EMBRYOSCOPE)?;
    let columns = db.columns(GOLD_EMBRYOSCOPE)?.len();
    tracing::info!("💾 {}: {} rows, {} columns", GOLD_EMBRYOSCOPE, rows, columns);
    Ok(rows)
}

/// `embryoscope-gold` 階段
pub struct EmbryoscopeGoldStage {
    config: Arc<LakeConfig>,
}

impl EmbryoscopeGoldStage {
    pub fn new(config: Arc<LakeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for EmbryoscopeGoldStage {
    fn name(&self) -> &str {
        "embryoscope-gold"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let central = self.config.lake.central_db_path();
        let path = central.clone();
        let rows = blocking(move || build_embryoscope_gold(&path)).await?;

        let mut report = StageReport::new(self.name());
        report.rows_written = rows;
        report.tables.push(GOLD_EMBRYOSCOPE.to_string());
        report.outputs.push(central.display().to_string());
        Ok(report)
    }
}
