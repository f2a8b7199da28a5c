//! 已植入的胚胎 ⋈ 處方：長表 (胚胎 × 處方) 與依藥物群組展開的寬表

use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::app::pipelines::combined_gold::GOLD_COMBINED;
use crate::config::lake_config::LakeConfig;
use crate::core::etl::blocking;
use crate::domain::model::{Record, StageContext, StageReport, Table};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub const GOLD_PRESCRIPTION_LONG: &str = "gold_embryos_with_prescription_long";
pub const GOLD_PRESCRIPTION_WIDE: &str = "gold_embryos_with_prescription_wide";

const SCHEMA: &str = "clinisys";
const PRESCRIPTIONS: &str = "silver_view_medicamentos_prescricoes";
const TREATMENTS: &str = "silver_view_tratamentos";

/// 帶進長表的處方欄位，輸出時加上 `presc_` 前綴
const PRESCRIPTION_COLUMNS: [&str; 13] = [
    "id",
    "ficha_id",
    "medicamento",
    "med_nome",
    "dose",
    "unidade",
    "unidade_padronizada",
    "intervalo",
    "data_inicial",
    "data_final",
    "numero_dias",
    "dose_total",
    "grupo_medicamento",
];

const PRESC_PREFIX: &str = "presc_";
const GROUP_COLUMN: &str = "presc_grupo_medicamento";

/// 處方 join 統計
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrescriptionStatistics {
    pub source_rows: usize,
    pub transferred_rows: usize,
    pub transferred_embryos: usize,
    pub embryos_with_treatment: usize,
    pub long_rows: usize,
    pub matched_embryos: usize,
    pub match_rate: f64,
    pub wide_rows: usize,
    pub embryos_per_group: BTreeMap<String, usize>,
    pub skipped: bool,
}

impl PrescriptionStatistics {
    pub fn log(&self) {
        tracing::info!(
            "📊 Source rows={}, transferred rows={} ({} embryos), with treatment={}",
            self.source_rows,
            self.transferred_rows,
            self.transferred_embryos,
            self.embryos_with_treatment
        );
        tracing::info!(
            "📊 {}: {} rows, matched embryos={} ({:.1}%)",
            GOLD_PRESCRIPTION_LONG,
            self.long_rows,
            self.matched_embryos,
            self.match_rate
        );
        let mut groups: Vec<(&String, &usize)> = self.embryos_per_group.iter().collect();
        groups.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (group, embryos) in groups.into_iter().take(10) {
            tracing::info!("📊   {:<30} {:>8}", group, embryos);
        }
    }
}

/// 植入：新鮮植入 (TCD = Transferido) 或解凍後有植入日期
fn transfer_filter(has_thaw_transfer: bool) -> String {
    if has_thaw_transfer {
        "(f.oocito_TCD = 'Transferido' OR f.descong_em_DataTransferencia IS NOT NULL)".to_string()
    } else {
        "f.oocito_TCD = 'Transferido'".to_string()
    }
}

/// 每個胚胎對應的療程 (trat1_id)：同 prontuario，
/// 解凍植入比對 data_transferencia，新鮮週期比對 data_procedimento = Data_DL；多筆取最小 id
fn treatment_expr(has_thaw_transfer: bool) -> String {
    let fresh = "date(t.data_procedimento) = date(f.micro_Data_DL)";
    let condition = if has_thaw_transfer {
        format!(
            "((f.descong_em_DataTransferencia IS NOT NULL AND date(t.data_transferencia) = date(f.descong_em_DataTransferencia))\n        OR (f.descong_em_DataTransferencia IS NULL AND {}))",
            fresh
        )
    } else {
        fresh.to_string()
    };
    format!(
        "(SELECT MIN(t.id) FROM {schema}.{treatments} t\n      WHERE t.prontuario = f.micro_prontuario\n        AND {condition})",
        schema = SCHEMA,
        treatments = quote_ident(TREATMENTS),
        condition = condition
    )
}

fn prescription_select(available: &[String]) -> Vec<String> {
    PRESCRIPTION_COLUMNS
        .iter()
        .map(|column| {
            let alias = quote_ident(&format!("{}{}", PRESC_PREFIX, column));
            if available.iter().any(|c| c == column) {
                format!("p.{} AS {}", quote_ident(column), alias)
            } else {
                format!("NULL AS {}", alias)
            }
        })
        .collect()
}

pub fn long_sql(has_thaw_transfer: bool, prescription_columns: &[String]) -> String {
    format!(
        "SELECT e.*,\n       {presc}\nFROM (SELECT f.*, {treatment} AS trat1_id\n      FROM {combined} f\n      WHERE {filter}) e\nJOIN {schema}.{prescriptions} p ON e.trat1_id = p.ficha_id\nORDER BY e.oocito_id, p.id",
        presc = prescription_select(prescription_columns).join(",\n       "),
        treatment = treatment_expr(has_thaw_transfer),
        combined = GOLD_COMBINED,
        filter = transfer_filter(has_thaw_transfer),
        schema = SCHEMA,
        prescriptions = quote_ident(PRESCRIPTIONS),
    )
}

fn count(db: &LakeDb, sql: &str) -> Result<usize> {
    Ok(db.scalar_i64(sql, &[])?.unwrap_or(0).max(0) as usize)
}

#[derive(Debug, Default)]
struct GroupTotals {
    dose: Option<f64>,
    days: Option<f64>,
    start: Option<String>,
    end: Option<String>,
    unit: Value,
    interval: Value,
}

fn add_opt(total: Option<f64>, value: Option<f64>) -> Option<f64> {
    match (total, value) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

fn float_value(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn text_value(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

/// 長表 → 每個 oocito_id 一列，每個藥物群組展開成
/// `{群組}_dose|days|start|end|unit|interval`
pub fn pivot_wide(long: &Table) -> Table {
    let metadata_columns: Vec<String> = long
        .columns
        .iter()
        .filter(|c| !c.starts_with(PRESC_PREFIX))
        .cloned()
        .collect();

    let mut order: Vec<(Option<i64>, String)> = Vec::new();
    let mut metadata: HashMap<String, Record> = HashMap::new();
    let mut totals: HashMap<(String, String), GroupTotals> = HashMap::new();
    let mut groups = BTreeSet::new();

    for row in &long.rows {
        let Some(key) = row.text("oocito_id") else {
            continue;
        };
        if !metadata.contains_key(&key) {
            let mut meta = Record::new();
            for column in &metadata_columns {
                meta.insert(column.clone(), row.get(column).cloned().unwrap_or(Value::Null));
            }
            metadata.insert(key.clone(), meta);
            order.push((row.int("oocito_id"), key.clone()));
        }

        let Some(group) = row.text(GROUP_COLUMN) else {
            continue;
        };
        groups.insert(group.clone());
        let entry = totals.entry((key, group)).or_insert_with(|| GroupTotals {
            unit: row.get("presc_unidade_padronizada").cloned().unwrap_or(Value::Null),
            interval: row.get("presc_intervalo").cloned().unwrap_or(Value::Null),
            ..GroupTotals::default()
        });
        entry.dose = add_opt(entry.dose, row.float("presc_dose_total"));
        entry.days = add_opt(entry.days, row.float("presc_numero_dias"));
        if let Some(start) = row.text("presc_data_inicial") {
            if entry.start.as_ref().map(|s| start < *s).unwrap_or(true) {
                entry.start = Some(start);
            }
        }
        if let Some(end) = row.text("presc_data_final") {
            if entry.end.as_ref().map(|e| end > *e).unwrap_or(true) {
                entry.end = Some(end);
            }
        }
    }

    order.sort_by(|a, b| b.cmp(a));

    let mut columns = metadata_columns;
    for group in &groups {
        for suffix in ["dose", "days", "start", "end", "unit", "interval"] {
            columns.push(format!("{}_{}", group, suffix));
        }
    }

    let mut wide = Table::new(GOLD_PRESCRIPTION_WIDE, columns);
    for (_, key) in order {
        let Some(mut row) = metadata.remove(&key) else {
            continue;
        };
        for group in &groups {
            let t = totals.remove(&(key.clone(), group.clone())).unwrap_or_default();
            row.insert(format!("{}_dose", group), float_value(t.dose));
            row.insert(format!("{}_days", group), float_value(t.days));
            row.insert(format!("{}_start", group), text_value(t.start));
            row.insert(format!("{}_end", group), text_value(t.end));
            row.insert(format!("{}_unit", group), t.unit);
            row.insert(format!("{}_interval", group), t.interval);
        }
        wide.push(row);
    }
    wide
}

fn build_long(db: &LakeDb) -> Result<Option<PrescriptionStatistics>> {
    for table in [PRESCRIPTIONS, TREATMENTS] {
        if !db.table_exists_in(SCHEMA, table)? {
            tracing::warn!("⚠️ {} not found, prescription tables not built", table);
            return Ok(None);
        }
    }

    let combined_columns = db.columns(GOLD_COMBINED)?;
    let has_thaw_transfer = combined_columns
        .iter()
        .any(|c| c == "descong_em_DataTransferencia");
    let prescription_columns = db.columns_in(SCHEMA, PRESCRIPTIONS)?;

    let mut stats = PrescriptionStatistics {
        source_rows: db.count(GOLD_COMBINED)?,
        ..PrescriptionStatistics::default()
    };
    let filter = transfer_filter(has_thaw_transfer);
    stats.transferred_rows = count(
        db,
        &format!("SELECT COUNT(*) FROM {} f WHERE {}", GOLD_COMBINED, filter),
    )?;
    stats.transferred_embryos = count(
        db,
        &format!("SELECT COUNT(DISTINCT f.oocito_id) FROM {} f WHERE {}", GOLD_COMBINED, filter),
    )?;
    stats.embryos_with_treatment = count(
        db,
        &format!(
            "SELECT COUNT(DISTINCT f.oocito_id) FROM {} f WHERE {} AND {} IS NOT NULL",
            GOLD_COMBINED,
            filter,
            treatment_expr(has_thaw_transfer)
        ),
    )?;

    let sql = long_sql(has_thaw_transfer, &prescription_columns);
    tracing::debug!("Prescription SQL:\n{}", sql);
    db.execute_batch(&format!(
        "DROP TABLE IF EXISTS main.{t};\nCREATE TABLE main.{t} AS {sql};",
        t = GOLD_PRESCRIPTION_LONG,
        sql = sql
    ))?;
    Ok(Some(stats))
}

pub fn build_prescription_gold(central_db: &Path, clinisys_db: &Path) -> Result<PrescriptionStatistics> {
    if !clinisys_db.exists() {
        return Err(EtlError::ProcessingError {
            message: format!("{} not found", clinisys_db.display()),
        });
    }
    let db = LakeDb::open(central_db)?;
    if !db.table_exists(GOLD_COMBINED)? {
        return Err(EtlError::ProcessingError {
            message: format!("{} not found; run combine first", GOLD_COMBINED),
        });
    }

    db.attach(clinisys_db, SCHEMA)?;
    let outcome = build_long(&db);
    db.detach(SCHEMA)?;

    let Some(mut stats) = outcome? else {
        return Ok(PrescriptionStatistics {
            skipped: true,
            ..PrescriptionStatistics::default()
        });
    };

    let long = db.read_table(GOLD_PRESCRIPTION_LONG)?;
    stats.long_rows = long.len();
    let mut per_group: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    let mut matched = HashSet::new();
    for row in &long.rows {
        if let Some(id) = row.text("oocito_id") {
            if let Some(group) = row.text(GROUP_COLUMN) {
                per_group.entry(group).or_default().insert(id.clone());
            }
            matched.insert(id);
        }
    }
    stats.matched_embryos = matched.len();
    stats.match_rate = if stats.transferred_embryos == 0 {
        0.0
    } else {
        stats.matched_embryos as f64 * 100.0 / stats.transferred_embryos as f64
    };
    stats.embryos_per_group = per_group.into_iter().map(|(g, ids)| (g, ids.len())).collect();

    let wide = pivot_wide(&long);
    if wide.is_empty() {
        tracing::warn!("⚠️ No embryo matched a prescription, {} not written", GOLD_PRESCRIPTION_WIDE);
        db.drop_table(GOLD_PRESCRIPTION_WIDE)?;
    } else {
        stats.wide_rows = db.replace_table(&wide)?;
        tracing::info!(
            "💾 {}: {} rows, {} columns",
            GOLD_PRESCRIPTION_WIDE,
            stats.wide_rows,
            wide.columns.len()
        );
    }

    stats.log();
    Ok(stats)
}

/// `prescriptions` 階段
pub struct PrescriptionGoldStage {
    config: Arc<LakeConfig>,
}

impl PrescriptionGoldStage {
    pub fn new(config: Arc<LakeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for PrescriptionGoldStage {
    fn name(&self) -> &str {
        "prescriptions"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let central = self.config.lake.central_db_path();
        let clinisys = self.config.lake.clinisys_db_path();
        let path = central.clone();
        let stats = blocking(move || build_prescription_gold(&path, &clinisys)).await?;

        let mut report = StageReport::new(self.name());
        report.rows_read = stats.transferred_rows;
        report.rows_written = stats.long_rows + stats.wide_rows;
        if !stats.skipped {
            report.tables.push(GOLD_PRESCRIPTION_LONG.to_string());
            report.tables.push(GOLD_PRESCRIPTION_WIDE.to_string());
            report.outputs.push(central.display().to_string());
        }
        report
            .metadata
            .insert("prescription_statistics".to_string(), serde_json::to_value(&stats)?);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn embryo(id: i64, tcd: &str, thaw_transfer: Option<&str>) -> Record {
        Record::from_pairs([
            ("oocito_id", json!(id)),
            ("oocito_TCD", json!(tcd)),
            ("micro_prontuario", json!(100)),
            ("micro_Data_DL", json!("2024-01-10")),
            ("descong_em_DataTransferencia", thaw_transfer.map(|d| json!(d)).unwrap_or(Value::Null)),
            ("embryo_EmbryoID", json!(format!("E{}", id))),
        ])
    }

    fn prescription(id: i64, ficha: i64, group: &str, dose_total: f64, days: i64, start: &str, end: &str) -> Record {
        Record::from_pairs([
            ("id", json!(id)),
            ("ficha_id", json!(ficha)),
            ("medicamento", json!(10)),
            ("dose", json!(2.0)),
            ("unidade_padronizada", json!("mg")),
            ("intervalo", json!(24)),
            ("data_inicial", json!(start)),
            ("data_final", json!(end)),
            ("numero_dias", json!(days)),
            ("dose_total", json!(dose_total)),
            ("grupo_medicamento", json!(group)),
        ])
    }

    fn seed(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let central = dir.path().join("central.db");
        let clinisys = dir.path().join("clinisys_all.db");

        LakeDb::open(&central)
            .unwrap()
            .replace_table(&Table::from_records(
                GOLD_COMBINED,
                vec![
                    embryo(1, "Transferido", None),
                    embryo(2, "Descartado", None),
                    embryo(3, "Criopreservado", Some("2024-03-05")),
                    embryo(4, "Transferido", None),
                ],
            ))
            .unwrap();

        let db = LakeDb::open(&clinisys).unwrap();
        db.replace_table(&Table::from_records(
            TREATMENTS,
            vec![
                Record::from_pairs([
                    ("id", json!(501)),
                    ("prontuario", json!(100)),
                    ("data_procedimento", json!("2024-01-10")),
                    ("data_transferencia", json!("2024-01-15")),
                ]),
                Record::from_pairs([
                    ("id", json!(502)),
                    ("prontuario", json!(100)),
                    ("data_procedimento", Value::Null),
                    ("data_transferencia", json!("2024-03-05")),
                ]),
                Record::from_pairs([
                    ("id", json!(900)),
                    ("prontuario", json!(999)),
                    ("data_procedimento", json!("2024-01-10")),
                    ("data_transferencia", Value::Null),
                ]),
            ],
        ))
        .unwrap();
        db.replace_table(&Table::from_records(
            PRESCRIPTIONS,
            vec![
                prescription(1, 501, "PROGESTERONA", 400.0, 10, "2024-01-15", "2024-01-24"),
                prescription(2, 501, "PROGESTERONA", 200.0, 5, "2024-01-25", "2024-01-29"),
                prescription(3, 501, "ESTRADIOL", 60.0, 30, "2024-01-01", "2024-01-30"),
                prescription(4, 502, "ESTRADIOL", 90.0, 45, "2024-02-20", "2024-04-05"),
                prescription(5, 900, "ESTRADIOL", 1.0, 1, "2024-01-01", "2024-01-01"),
            ],
        ))
        .unwrap();
        (central, clinisys)
    }

    #[test]
    fn test_long_table_joins_transferred_embryos_to_prescriptions() {
        let dir = TempDir::new().unwrap();
        let (central, clinisys) = seed(&dir);
        let stats = build_prescription_gold(&central, &clinisys).unwrap();

        assert!(!stats.skipped);
        assert_eq!(stats.source_rows, 4);
        assert_eq!(stats.transferred_embryos, 3);
        assert_eq!(stats.embryos_with_treatment, 3);
        // embryos 1 and 4 → 501 (3 prescriptions each), embryo 3 thawed → 502
        assert_eq!(stats.long_rows, 7);
        assert_eq!(stats.matched_embryos, 3);
        assert_eq!(stats.embryos_per_group["PROGESTERONA"], 2);
        assert_eq!(stats.embryos_per_group["ESTRADIOL"], 3);

        let db = LakeDb::open(&central).unwrap();
        let thawed = db
            .query_records(
                &format!("SELECT trat1_id, presc_ficha_id, presc_med_nome FROM {} WHERE oocito_id = 3", GOLD_PRESCRIPTION_LONG),
                &[],
            )
            .unwrap();
        assert_eq!(thawed.len(), 1);
        assert_eq!(thawed[0].int("trat1_id"), Some(502));
        assert_eq!(thawed[0].int("presc_ficha_id"), Some(502));
        assert!(thawed[0].is_null("presc_med_nome"));
        assert_eq!(
            db.scalar_i64(&format!("SELECT COUNT(*) FROM {} WHERE oocito_id = 2", GOLD_PRESCRIPTION_LONG), &[])
                .unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_wide_table_aggregates_per_group() {
        let dir = TempDir::new().unwrap();
        let (central, clinisys) = seed(&dir);
        let stats = build_prescription_gold(&central, &clinisys).unwrap();
        assert_eq!(stats.wide_rows, 3);

        let db = LakeDb::open(&central).unwrap();
        let wide = db.read_table(GOLD_PRESCRIPTION_WIDE).unwrap();
        assert!(wide.columns.iter().all(|c| !c.starts_with(PRESC_PREFIX)));
        assert_eq!(wide.rows[0].int("oocito_id"), Some(4));

        let first = wide.rows.iter().find(|r| r.int("oocito_id") == Some(1)).unwrap();
        assert_eq!(first.float("PROGESTERONA_dose"), Some(600.0));
        assert_eq!(first.float("PROGESTERONA_days"), Some(15.0));
        assert_eq!(first.text("PROGESTERONA_start").as_deref(), Some("2024-01-15"));
        assert_eq!(first.text("PROGESTERONA_end").as_deref(), Some("2024-01-29"));
        assert_eq!(first.text("PROGESTERONA_unit").as_deref(), Some("mg"));

        let thawed = wide.rows.iter().find(|r| r.int("oocito_id") == Some(3)).unwrap();
        assert!(thawed.is_null("PROGESTERONA_dose"));
        assert_eq!(thawed.float("ESTRADIOL_dose"), Some(90.0));
    }

    #[test]
    fn test_missing_prescriptions_skips_without_error() {
        let dir = TempDir::new().unwrap();
        let (central, clinisys) = seed(&dir);
        LakeDb::open(&clinisys).unwrap().drop_table(PRESCRIPTIONS).unwrap();

        let stats = build_prescription_gold(&central, &clinisys).unwrap();
        assert!(stats.skipped);
        assert!(!LakeDb::open(&central).unwrap().table_exists(GOLD_PRESCRIPTION_LONG).unwrap());
    }

    #[test]
    fn test_missing_combined_table_fails() {
        let dir = TempDir::new().unwrap();
        let clinisys = dir.path().join("clinisys_all.db");
        LakeDb::open(&clinisys).unwrap();
        let err = build_prescription_gold(&dir.path().join("central.db"), &clinisys).unwrap_err();
        assert!(err.to_string().contains(GOLD_COMBINED));
    }

    #[test]
    fn test_long_sql_without_thaw_columns() {
        let sql = long_sql(false, &["id".to_string(), "ficha_id".to_string()]);
        assert!(sql.contains("f.oocito_TCD = 'Transferido'"));
        assert!(!sql.contains("descong_em_DataTransferencia"));
        assert!(sql.contains("NULL AS \"presc_grupo_medicamento\""));
        assert!(sql.contains("p.\"ficha_id\" AS \"presc_ficha_id\""));
    }
}
