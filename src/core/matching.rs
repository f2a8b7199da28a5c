//! Embryoscope 病患 → Clinisys prontuario 對應

use crate::core::text::{first_word, normalize};
use crate::domain::model::Record;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub const UNMATCHED: i64 = -1;

/// (欄位, 優先序)；數字越小越優先
const ID_COLUMNS: [(&str, u8); 15] = [
    ("codigo", 1),
    ("prontuario_esposa", 2),
    ("prontuario_marido", 2),
    ("prontuario_responsavel1", 3),
    ("prontuario_responsavel2", 3),
    ("prontuario_esposa_pel", 3),
    ("prontuario_marido_pel", 3),
    ("prontuario_esposa_pc", 3),
    ("prontuario_marido_pc", 3),
    ("prontuario_responsavel1_pc", 3),
    ("prontuario_responsavel2_pc", 3),
    ("prontuario_esposa_fc", 3),
    ("prontuario_marido_fc", 3),
    ("prontuario_esposa_ba", 3),
    ("prontuario_marido_ba", 3),
];

/// view_pacientes 的一列，只留比對需要的欄位
#[derive(Debug, Clone)]
pub struct ClinisysPatient {
    pub codigo: i64,
    pub inactive: bool,
    ids: Vec<(i64, u8)>,
    esposa_first: Option<String>,
    marido_first: Option<String>,
    esposa_full: Option<String>,
    marido_full: Option<String>,
}

impl ClinisysPatient {
    pub fn from_record(record: &Record) -> Option<Self> {
        let codigo = record.int("codigo")?;
        let ids = ID_COLUMNS
            .iter()
            .filter_map(|(column, priority)| record.int(column).map(|id| (id, *priority)))
            .collect();
        let esposa = record.text("esposa_nome");
        let marido = record.text("marido_nome");
        Some(Self {
            codigo,
            inactive: record.int("inativo").unwrap_or(0) == 1,
            ids,
            esposa_first: esposa.as_deref().and_then(first_word),
            marido_first: marido.as_deref().and_then(first_word),
            esposa_full: esposa.as_deref().map(normalize),
            marido_full: marido.as_deref().map(normalize),
        })
    }

    fn first_name_matches(&self, name_first: Option<&str>) -> bool {
        match name_first {
            None => true,
            Some(name) => [&self.esposa_first, &self.marido_first]
                .iter()
                .any(|n| n.as_deref().map(|n| n.contains(name)).unwrap_or(false)),
        }
    }

    fn full_name_contains(&self, needle: &str) -> bool {
        [&self.esposa_full, &self.marido_full]
            .iter()
            .any(|n| n.as_deref().map(|n| n.contains(needle)).unwrap_or(false))
    }
}

/// FirstName → 比對用的名字
///
/// "VALADARES, FLAVIA.F.N." → "flavia"；"MARIA JOSE" → "maria"。
pub fn name_first(first_name: Option<&str>) -> Option<String> {
    let raw = first_name?;
    let part = if raw.contains(',') {
        raw.split(',').nth(1).unwrap_or("")
    } else {
        raw
    };
    let normalized = normalize(part);
    let letters: String = normalized
        .chars()
        .skip_while(|c| !c.is_ascii_lowercase())
        .take_while(|c| c.is_ascii_lowercase())
        .collect();
    if letters.is_empty() {
        Some(normalized)
    } else {
        Some(letters)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchSummary {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub matched_active: usize,
    pub matched_inactive: usize,
    pub matched_last_name: usize,
}

impl MatchSummary {
    pub fn match_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.matched as f64 * 100.0 / self.total as f64
        }
    }

    pub fn quality(&self) -> &'static str {
        let rate = self.match_rate();
        if rate >= 95.0 {
            "EXCELLENT"
        } else if rate >= 85.0 {
            "GOOD"
        } else if rate >= 70.0 {
            "ACCEPTABLE"
        } else {
            "NEEDS ATTENTION"
        }
    }

    pub fn log(&self, location: &str) {
        tracing::info!(
            "📊 [{}] Prontuario matching: total={}, matched={}, unmatched={}, rate={:.2}%",
            location,
            self.total,
            self.matched,
            self.unmatched,
            self.match_rate()
        );
        tracing::info!(
            "📊 [{}]   by pass: active={}, inactive={}, last_name={}",
            location,
            self.matched_active,
            self.matched_inactive,
            self.matched_last_name
        );
        if self.match_rate() >= 70.0 {
            tracing::info!("✅ [{}] Match quality: {}", location, self.quality());
        } else {
            tracing::warn!("⚠️ [{}] Match quality: {}", location, self.quality());
        }
    }
}

fn is_unmatched(row: &Record) -> bool {
    row.int("prontuario") == Some(UNMATCHED)
}

fn id_pass(patients: &mut [Record], clinisys: &[&ClinisysPatient]) -> usize {
    let mut index: HashMap<i64, Vec<(u8, &ClinisysPatient)>> = HashMap::new();
    for patient in clinisys {
        for (id, priority) in &patient.ids {
            index.entry(*id).or_default().push((*priority, *patient));
        }
    }

    // (PatientID, name_first) → 最佳 codigo
    let mut decisions: BTreeMap<(i64, Option<String>), Option<i64>> = BTreeMap::new();
    for row in patients.iter().filter(|r| is_unmatched(r)) {
        let Some(patient_id) = row.int("PatientID") else { continue };
        let first = name_first(row.text("FirstName").as_deref());
        decisions.entry((patient_id, first)).or_insert(None);
    }

    for ((patient_id, first), decision) in decisions.iter_mut() {
        let Some(candidates) = index.get(patient_id) else { continue };
        *decision = candidates
            .iter()
            .filter(|(_, c)| c.first_name_matches(first.as_deref()))
            .min_by(|(pa, ca), (pb, cb)| pa.cmp(pb).then(cb.codigo.cmp(&ca.codigo)))
            .map(|(_, c)| c.codigo);
    }

    let mut updated = 0;
    for row in patients.iter_mut().filter(|r| is_unmatched(r)) {
        let Some(patient_id) = row.int("PatientID") else { continue };
        let first = name_first(row.text("FirstName").as_deref());
        if let Some(Some(codigo)) = decisions.get(&(patient_id, first)) {
            row.insert("prontuario", Value::from(*codigo));
            updated += 1;
        }
    }
    updated
}

fn last_name_pass(patients: &mut [Record], active: &[&ClinisysPatient]) -> usize {
    let mut updated = 0;
    for row in patients.iter_mut().filter(|r| is_unmatched(r)) {
        if row.is_null("PatientID") {
            continue;
        }
        let (Some(first), Some(last)) = (row.text("FirstName"), row.text("LastName")) else {
            continue;
        };
        if !(first.contains('.') || first.chars().count() < 4) {
            continue;
        }
        let needle = normalize(&format!("{} {}", first.replace('.', ""), last));
        if needle.is_empty() {
            continue;
        }
        let best = active
            .iter()
            .filter(|c| c.full_name_contains(&needle))
            .map(|c| c.codigo)
            .max();
        if let Some(codigo) = best {
            row.insert("prontuario", Value::from(codigo));
            updated += 1;
        }
    }
    updated
}

/// 三輪比對：啟用中病患 ID、停用病患 ID、姓氏
///
/// 只處理 prontuario = -1 的列，結果一律是 Clinisys 的 codigo。
pub fn match_prontuarios(patients: &mut [Record], clinisys: &[ClinisysPatient]) -> MatchSummary {
    let active: Vec<&ClinisysPatient> = clinisys.iter().filter(|c| !c.inactive).collect();
    let inactive: Vec<&ClinisysPatient> = clinisys.iter().filter(|c| c.inactive).collect();

    let matched_active = id_pass(patients, &active);
    let matched_inactive = id_pass(patients, &inactive);
    let matched_last_name = last_name_pass(patients, &active);

    let total = patients.len();
    let unmatched = patients.iter().filter(|r| is_unmatched(r)).count();
    MatchSummary {
        total,
        matched: total - unmatched,
        unmatched,
        matched_active,
        matched_inactive,
        matched_last_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clinisys(codigo: i64, esposa: &str, extra: &[(&str, i64)], inativo: i64) -> ClinisysPatient {
        let mut r = Record::new();
        r.insert("codigo", json!(codigo));
        r.insert("esposa_nome", json!(esposa));
        r.insert("marido_nome", json!("Carlos Souza"));
        r.insert("inativo", json!(inativo));
        for (k, v) in extra {
            r.insert(*k, json!(v));
        }
        ClinisysPatient::from_record(&r).unwrap()
    }

    fn patient(id: i64, first: &str, last: &str) -> Record {
        Record::from_pairs([
            ("PatientID", json!(id)),
            ("FirstName", json!(first)),
            ("LastName", json!(last)),
            ("prontuario", json!(UNMATCHED)),
        ])
    }

    #[test]
    fn test_name_first() {
        assert_eq!(name_first(Some("VALADARES, FLAVIA.F.N.")), Some("flavia".to_string()));
        assert_eq!(name_first(Some("  Conceição Maria")), Some("conceicao".to_string()));
        assert_eq!(name_first(Some("123")), Some("123".to_string()));
        assert_eq!(name_first(None), None);
    }

    #[test]
    fn test_codigo_beats_spouse_id() {
        let rows = vec![
            clinisys(500, "Ana Lima", &[("prontuario_esposa", 100)], 0),
            clinisys(100, "Ana Paula", &[], 0),
        ];
        let mut patients = vec![patient(100, "ANA", "LIMA")];
        let summary = match_prontuarios(&mut patients, &rows);
        assert_eq!(patients[0].int("prontuario"), Some(100));
        assert_eq!(summary.matched_active, 1);
    }

    #[test]
    fn test_name_mismatch_is_rejected_and_inactive_pass_used() {
        let rows = vec![
            clinisys(200, "Beatriz Costa", &[], 0),
            clinisys(300, "Julia Costa", &[("prontuario_esposa", 200)], 1),
        ];
        let mut patients = vec![patient(200, "Julia", "Costa")];
        let summary = match_prontuarios(&mut patients, &rows);
        assert_eq!(patients[0].int("prontuario"), Some(300));
        assert_eq!(summary.matched_inactive, 1);
        assert_eq!(summary.quality(), "EXCELLENT");
    }

    #[test]
    fn test_last_name_pass() {
        let rows = vec![
            clinisys(700, "Mariana Alves Pereira", &[], 0),
            clinisys(710, "Mariana Alves Pereira", &[], 0),
        ];
        let mut patients = vec![patient(999, "M.", "Alves Pereira"), patient(998, "Fernanda", "Rocha")];
        let summary = match_prontuarios(&mut patients, &rows);
        assert_eq!(patients[0].int("prontuario"), Some(UNMATCHED));
        assert_eq!(summary.matched_last_name, 0);

        let mut patients = vec![patient(999, ".", "Mariana Alves")];
        let summary = match_prontuarios(&mut patients, &rows);
        assert_eq!(patients[0].int("prontuario"), Some(710));
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.unmatched, 0);
    }
}
