//! 中央 DB：附加 clinisys_all.db 後建立 gold_clinisys_embrioes

use crate::adapters::lake_db::{quote_ident, LakeDb};
use crate::config::lake_config::LakeConfig;
use crate::core::etl::blocking;
use crate::domain::model::{StageContext, StageReport};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub const GOLD_CLINISYS: &str = "gold_clinisys_embrioes";

const SCHEMA: &str = "clinisys";

/// 一個參與 join 的 silver 表
struct JoinPart {
    table: &'static str,
    alias: &'static str,
    prefix: &'static str,
    condition: &'static str,
    requires: Option<&'static str>,
}

const OPTIONAL_JOINS: [JoinPart; 5] = [
    JoinPart {
        table: "silver_view_congelamentos_ovulos",
        alias: "vco",
        prefix: "cong_ov_",
        condition: "vco.Ciclo = mic.numero_caso AND vco.prontuario = mic.prontuario AND ooc.TCD = 'Criopreservado' AND vco.Ciclo IS NOT NULL",
        requires: None,
    },
    JoinPart {
        table: "silver_view_descongelamentos_ovulos",
        alias: "vdo",
        prefix: "descong_ov_",
        condition: "vdo.DataDescongelamento = mic.Data_DL AND vdo.prontuario = mic.prontuario",
        requires: None,
    },
    JoinPart {
        table: "silver_view_congelamentos_embrioes",
        alias: "vce",
        prefix: "cong_em_",
        condition: "vce.Ciclo = mic.numero_caso AND vce.prontuario = mic.prontuario AND ooc.TCD = 'Criopreservado'",
        requires: None,
    },
    JoinPart {
        table: "silver_view_descongelamentos_embrioes",
        alias: "vde",
        prefix: "descong_em_",
        condition: "vde.Ciclo = mic.numero_caso AND vde.CodCongelamento = vce.CodCongelamento",
        requires: Some("vce"),
    },
    JoinPart {
        table: "silver_view_embrioes_congelados",
        alias: "vec",
        prefix: "emb_cong_",
        condition: "vec.id_oocito = ooc.id",
        requires: None,
    },
];

fn is_excluded(column: &str) -> bool {
    column.contains("hash") || column.contains("extraction_timestamp")
}

fn prefixed_columns(columns: &[String], alias: &str, prefix: &str) -> Vec<String> {
    columns
        .iter()
        .filter(|c| !is_excluded(c))
        .map(|c| {
            format!(
                "{}.{} AS {}",
                alias,
                quote_ident(c),
                quote_ident(&format!("{}{}", prefix, c))
            )
        })
        .collect()
}

fn qualified(table: &str) -> String {
    format!("{}.{}", SCHEMA, quote_ident(table))
}

/// 依現有的表組出 SQL；缺少的選用表連同依賴它的 join 一起略過
fn build_sql(db: &LakeDb) -> Result<String> {
    for required in ["silver_view_micromanipulacao_oocitos", "silver_view_micromanipulacao"] {
        if !db.table_exists_in(SCHEMA, required)? {
            return Err(EtlError::ProcessingError {
                message: format!("{} not found; run clinisys-silver first", required),
            });
        }
    }

    let mut select = prefixed_columns(
        &db.columns_in(SCHEMA, "silver_view_micromanipulacao_oocitos")?,
        "ooc",
        "oocito_",
    );
    select.extend(prefixed_columns(
        &db.columns_in(SCHEMA, "silver_view_micromanipulacao")?,
        "mic",
        "micro_",
    ));

    let mut joins = vec![format!(
        "LEFT JOIN {} mic ON ooc.id_micromanipulacao = mic.codigo_ficha",
        qualified("silver_view_micromanipulacao")
    )];
    let mut joined: Vec<&str> = Vec::new();

    for part in &OPTIONAL_JOINS {
        if let Some(dependency) = part.requires {
            if !joined.contains(&dependency) {
                tracing::warn!("⚠️ Skipping {}: depends on missing {}", part.table, dependency);
                continue;
            }
        }
        if !db.table_exists_in(SCHEMA, part.table)? {
            tracing::warn!("⚠️ {} not found, join skipped", part.table);
            continue;
        }
        select.extend(prefixed_columns(
            &db.columns_in(SCHEMA, part.table)?,
            part.alias,
            part.prefix,
        ));
        joins.push(format!(
            "LEFT JOIN {} {} ON {}",
            qualified(part.table),
            part.alias,
            part.condition
        ));
        joined.push(part.alias);
    }

    Ok(format!(
        "SELECT {}\nFROM {} ooc\n{}\nORDER BY ooc.id_micromanipulacao, ooc.id",
        select.join(",\n       "),
        qualified("silver_view_micromanipulacao_oocitos"),
        joins.join("\n")
    ))
}

pub fn build_clinisys_gold(central_db: &Path, clinisys_db: &Path) -> Result<usize> {
    if !clinisys_db.exists() {
        return Err(EtlError::ProcessingError {
            message: format!("{} not found", clinisys_db.display()),
        });
    }
    let db = LakeDb::open(central_db)?;
    db.attach(clinisys_db, SCHEMA)?;

    let outcome = build_sql(&db).and_then(|sql| {
        tracing::debug!("Gold SQL:\n{}", sql);
        db.execute_batch(&format!(
            "DROP TABLE IF EXISTS main.{gold};\nCREATE TABLE main.{gold} AS {sql};",
            gold = GOLD_CLINISYS,
            sql = sql
        ))?;
        db.count(GOLD_CLINISYS)
    });
    db.detach(SCHEMA)?;

    let rows = outcome?;
    tracing::info!(
        "💾 {}: {} rows, {} columns",
        GOLD_CLINISYS,
        rows,
        db.columns(GOLD_CLINISYS)?.len()
    );
    Ok(rows)
}

/// `clinisys-gold` 階段
pub struct ClinisysGoldStage {
    config: Arc<LakeConfig>,
}

impl ClinisysGoldStage {
    pub fn new(config: Arc<LakeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for ClinisysGoldStage {
    fn name(&self) -> &str {
        "clinisys-gold"
    }

    async fn run(&self, _context: &StageContext) -> Result<StageReport> {
        let central = self.config.lake.central_db_path();
        let clinisys = self.config.lake.clinisys_db_path();
        let path = central.clone();
        let rows = blocking(move || build_clinisys_gold(&path, &clinisys)).await?;

        let mut report = StageReport::new(self.name());
        report.rows_written = rows;
        report.tables.push(GOLD_CLINISYS.to_string());
        report.outputs.push(central.display().to_string());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Record, Table};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_gold_with_only_required_tables() {
        let dir = TempDir::new().unwrap();
        let clinisys = dir.path().join("clinisys_all.db");
        let db = LakeDb::open(&clinisys).unwrap();
        db.replace_table(&Table::from_records(
            "silver_view_micromanipulacao_oocitos",
            vec![
                Record::from_pairs([("id", json!(2)), ("id_micromanipulacao", json!(7)), ("TCD", json!("Transferido")), ("hash", json!("h"))]),
                Record::from_pairs([("id", json!(1)), ("id_micromanipulacao", json!(7)), ("TCD", json!("Descartado")), ("hash", json!("h"))]),
            ],
        ))
        .unwrap();
        db.replace_table(&Table::from_records(
            "silver_view_micromanipulacao",
            vec![Record::from_pairs([
                ("codigo_ficha", json!(7)),
                ("prontuario", json!(100)),
                ("numero_caso", json!(1)),
                ("Data_DL", json!("2024-01-10")),
                ("extraction_timestamp", json!("2024-01-11 00:00:00")),
            ])],
        ))
        .unwrap();
        drop(db);

        let central = dir.path().join("central.db");
        assert_eq!(build_clinisys_gold(&central, &clinisys).unwrap(), 2);

        let db = LakeDb::open(&central).unwrap();
        let table = db.read_table(GOLD_CLINISYS).unwrap();
        assert_eq!(table.rows[0].int("oocito_id"), Some(1));
        assert_eq!(table.rows[0].int("micro_prontuario"), Some(100));
        assert!(!table.has_column("oocito_hash"));
        assert!(!table.has_column("micro_extraction_timestamp"));
        assert!(!table.has_column("cong_em_Ciclo"));
    }

    #[test]
    fn test_missing_required_table_fails() {
        let dir = TempDir::new().unwrap();
        let clinisys = dir.path().join("clinisys_all.db");
        LakeDb::open(&clinisys).unwrap();
        let err = build_clinisys_gold(&dir.path().join("central.db"), &clinisys).unwrap_err();
        assert!(matches!(err, EtlError::ProcessingError { .. }));
    }
}
