//! 各資料表的衍生欄位

use crate::core::casting::{parse_date, parse_dose, to_int_value, to_text_value};
use crate::domain::model::{Record, Table};
use chrono::Datelike;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

const NOT_TRANSFERRED: [&str; 3] = ["No transfer", "Cancelado", "Congelamento de Óvulos"];

pub const UNDEFINED_UNIT: &str = "NÃO DEFINIDO";

const UNIT_UI: &[&str] = &[
    "UI", "ui", "Ui", "U", "u", "IU", "uii", "UI ", "ui ", "unidades", "unidade", "UNIDADE",
    "UNIDADES", "UN",
];
const UNIT_MG: &[&str] = &[
    "mg", "Mg", "MG", "mg ", "miligrama", "mh", "g", "10mg", "200mg", "10MG", "200MG", "2mg",
    "0,25mg",
];
const UNIT_MCG: &[&str] = &["mgc", "mgg", "mcg", "Mcg", "MCG", "MgG"];
const UNIT_COMP: &[&str] = &[
    "comprimido", "comprimidos", "comprimido ", "comprimidos ", "comp", "Comp", "COMP",
    "COMPRIMIDO", "COMPRIMIDOS", "COMPRIMIDOS ", "COMPRMIDOS", "comprimido de 50",
    "comprimido - 5mg", "Comprimido - 5mg", "Comprimido - 20mg", "compirmidos ",
    "comprimido vermelho", "comprimidos omprimidos omprimido", " comprimido", "6omprimido",
    "comp de 200 mg", "comp ", "comp.", " comp", "3 comp", "1comp", "2comprimido", "cpr", "Cpg",
    "CPR", "CPR ", "Cpr", "Comprimido", "COMPRIMIDO ", "Comprimido vermelho", "Comprimidos",
    "3 comprimidos omprimidos omprimido", "Comprimido ", "3comp", "Comp ", "com",
    "Comprimido de 5 mg", "compridos", "compimido",
];
const UNIT_CAP: &[&str] = &[
    "cápsula", "cp", "CP", "Cp", "cp ", "1cp", "2cp", "cap", "caps", "capsula", "capsulas",
    "cápsulas", "cps", "CAPS", "CAPSULAS ", "capsulas ", "CAPsulas", "Caps", "caps.", "CAPS.",
    "capsule", "CPS", "1 CP", "cápsulas ", "Capsulas",
];
const UNIT_AMPOLA: &[&str] = &[
    "ampola", "ampolas", "Ampola", "AMPOLA", "ampolas ", "ampOLAS", "ampolasI", "ampolass",
    "ampolaS", "ampola ", "AMPOLAS ", "AMPOLAS", "amp.", "am", "ampo", "01 ampola", "1 ampola",
    "3 ampolas", "amp", "AMP", "1 AMPOLA", "Amp", "Ampolas", "AMP ", "2 amp", "AMPOLA ",
];
const UNIT_OVULO: &[&str] = &[
    "Ovulo Vaginal", "ovulos ", "ovulos", "óvulos", "Ovulos", "Óvulo", "óvulo", "OVULOS", "OVULO",
    "ovulo", "0VULOS", "0VULOS ", "2OVULOS", "1 OVULO", "ÓVULOS", "ÓVULO", "OVULOS ",
    "cápsulas via vaginal", " 0vulos", "ÓVULOS ",
];
const UNIT_PUMP: &[&str] = &[
    "pump", "pumps", "PUMP", "pumpS", "pumps ", "Pumps", "pumpss", "pump (medida)", "PUMPS",
    "Pump ",
];
const UNIT_PUFF: &[&str] = &["puff", "puffs", "pufss", "pufs", "puf", "púmp", "puff (1,25mg)"];
const UNIT_SERINGA: &[&str] = &[
    "seringa", "seringas", "SERINGAS", "Seringas", "seringas ", "SERINGA", "Injetável",
];
const UNIT_CANETA: &[&str] = &[
    "caneta", "CANETA", "canetas", "Caneta", "Canetas", "CANETAS", "caneta ", "canetas ",
    "canetaS", "CanetaS", "Canetas ", "CANETAS ", "canetaS ", "CanetaS ",
];
const UNIT_FRASCO: &[&str] = &["fr", "frasco"];

/// 處方單位 → 標準類別，比對原始字串 (區分大小寫與空白)
pub fn standardize_unit(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return UNDEFINED_UNIT;
    };
    let table: [(&[&str], &'static str); 12] = [
        (UNIT_UI, "UI"),
        (UNIT_MG, "mg"),
        (UNIT_MCG, "mcg"),
        (UNIT_COMP, "comp"),
        (UNIT_CAP, "cap"),
        (UNIT_AMPOLA, "ampola"),
        (UNIT_OVULO, "ovulo"),
        (UNIT_PUMP, "pump"),
        (UNIT_PUFF, "puff"),
        (UNIT_SERINGA, "seringa"),
        (UNIT_CANETA, "caneta"),
        (UNIT_FRASCO, "frasco"),
    ];
    table
        .iter()
        .find(|(values, _)| values.contains(&raw))
        .map(|(_, unit)| *unit)
        .unwrap_or(UNDEFINED_UNIT)
}

/// 藥名的第一個有意義的字；第一個字只有一個字元時取第二個
pub fn medication_group(name: &str) -> String {
    let upper = name.replace('-', " ").to_uppercase();
    let mut parts = upper.split(' ');
    let first = parts.next().unwrap_or("");
    if first.chars().count() <= 1 {
        parts.next().unwrap_or("").to_string()
    } else {
        first.to_string()
    }
}

/// view_micromanipulacao_oocitos：flag_embryoscope 與 embryo_number
///
/// embryo_number 在整個 id_micromanipulacao 內依 id 編號，未授精的卵為 null。
pub fn add_oocyte_features(table: &mut Table) {
    let mut groups: BTreeMap<Option<String>, Vec<(i64, usize)>> = BTreeMap::new();
    for (idx, row) in table.rows.iter().enumerate() {
        let id = row.int("id").unwrap_or(i64::MAX);
        groups
            .entry(row.text("id_micromanipulacao"))
            .or_default()
            .push((id, idx));
    }

    let mut numbers = vec![0i64; table.rows.len()];
    for members in groups.values_mut() {
        members.sort();
        for (rank, (_, idx)) in members.iter().enumerate() {
            numbers[*idx] = rank as i64 + 1;
        }
    }

    for (row, number) in table.rows.iter_mut().zip(numbers) {
        let flag = i64::from(!row.is_null("InseminacaoOocito"));
        row.insert("flag_embryoscope", Value::from(flag));
        let embryo_number = if flag == 1 { Value::from(number) } else { Value::Null };
        row.insert("embryo_number", embryo_number);
    }
    table.ensure_column("flag_embryoscope");
    table.ensure_column("embryo_number");
}

fn transfer_date(row: &Record) -> Option<String> {
    ["data_transferencia", "data_procedimento", "data_dum"]
        .iter()
        .find_map(|c| row.text(c))
}

fn counts_as_transfer(row: &Record) -> bool {
    match row.text("resultado_tratamento") {
        None => true,
        Some(result) => !NOT_TRANSFERRED.contains(&result.as_str()),
    }
}

/// view_tratamentos：bmi、previous_et、previous_et_od，unidade 轉整數
pub fn add_treatment_features(table: &mut Table) {
    let mut by_patient: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, row) in table.rows.iter().enumerate() {
        if let Some(p) = row.text("prontuario") {
            by_patient.entry(p).or_default().push(idx);
        }
    }

    let mut previous = vec![(0i64, 0i64); table.rows.len()];
    for members in by_patient.values() {
        for &i in members {
            let Some(current) = transfer_date(&table.rows[i]) else { continue };
            for &j in members {
                let prev = &table.rows[j];
                let earlier = transfer_date(prev).map(|d| d < current).unwrap_or(false);
                if earlier && counts_as_transfer(prev) {
                    previous[i].0 += 1;
                    if prev.text("doacao_ovulos").as_deref() == Some("Sim") {
                        previous[i].1 += 1;
                    }
                }
            }
        }
    }

    for (row, (et, et_od)) in table.rows.iter_mut().zip(previous) {
        let bmi = match (row.float("peso_paciente"), row.float("altura_paciente")) {
            (Some(peso), Some(altura)) if altura > 0.0 => {
                let value = (peso / (altura * altura) * 100.0).round() / 100.0;
                serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
            }
            _ => Value::Null,
        };
        row.insert("bmi", bmi);
        row.insert("previous_et", Value::from(et));
        row.insert("previous_et_od", Value::from(et_od));
        if let Some(unidade) = row.get("unidade").cloned() {
            row.insert("unidade", to_int_value(&unidade));
        }
    }
    for column in ["bmi", "previous_et", "previous_et_od"] {
        table.ensure_column(column);
    }
}

fn days_between(start: &str, end: &str) -> Option<i64> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    Some((end - start).num_days() + 1)
}

/// view_medicamentos_prescricoes 的處方欄位
///
/// `medicamentos` 為 view_medicamentos 的 id → 藥名。
pub fn add_prescription_features(table: &mut Table, medicamentos: &HashMap<i64, String>) {
    for row in table.rows.iter_mut() {
        let medicamento = row.get("medicamento").map(to_int_value).unwrap_or(Value::Null);
        let med_nome = medicamento
            .as_i64()
            .and_then(|id| medicamentos.get(&id))
            .cloned();

        let dose = row.get("dose").map(parse_dose).unwrap_or(Value::Null);
        let unidade = row.get("unidade").map(to_text_value).unwrap_or(Value::Null);
        let unidade_padronizada = standardize_unit(unidade.as_str());

        let numero_dias = match (row.text("data_inicial"), row.text("data_final")) {
            (Some(start), Some(end)) => days_between(&start, &end),
            _ => None,
        };

        let dose_total = match (numero_dias, dose.as_f64(), row.float("intervalo")) {
            (Some(days), Some(d), Some(interval)) if interval != 0.0 => {
                serde_json::Number::from_f64((days as f64 * d * (24.0 / interval)).abs())
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            _ => Value::Null,
        };

        row.insert("medicamento", medicamento);
        row.insert("dose", dose);
        row.insert("unidade", unidade);
        row.insert("unidade_padronizada", Value::from(unidade_padronizada));
        row.insert("numero_dias", numero_dias.map(Value::from).unwrap_or(Value::Null));
        row.insert("dose_total", dose_total);
        row.insert(
            "grupo_medicamento",
            med_nome.as_deref().map(|n| Value::from(medication_group(n))).unwrap_or(Value::Null),
        );
        row.insert("med_nome", med_nome.map(Value::from).unwrap_or(Value::Null));
    }
    for column in [
        "medicamento", "dose", "unidade", "med_nome", "unidade_padronizada", "numero_dias",
        "dose_total", "grupo_medicamento",
    ] {
        table.ensure_column(column);
    }
}

/// Embryoscope 胚胎序號：每個 (PatientIDx, TreatmentName) 依 WellNumber、EmbryoID 編號
pub fn assign_embryo_numbers(table: &mut Table) {
    let mut groups: BTreeMap<(Option<String>, Option<String>), Vec<usize>> = BTreeMap::new();
    for (idx, row) in table.rows.iter().enumerate() {
        groups
            .entry((row.text("PatientIDx"), row.text("TreatmentName")))
            .or_default()
            .push(idx);
    }

    let mut numbers = vec![0i64; table.rows.len()];
    for members in groups.values_mut() {
        members.sort_by(|&a, &b| {
            let (ra, rb) = (&table.rows[a], &table.rows[b]);
            let wa = ra.float("WellNumber");
            let wb = rb.float("WellNumber");
            let by_well = match (wa, wb) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            by_well.then_with(|| ra.text("EmbryoID").cmp(&rb.text("EmbryoID")))
        });
        for (rank, idx) in members.iter().enumerate() {
            numbers[*idx] = rank as i64 + 1;
        }
    }

    for (row, number) in table.rows.iter_mut().zip(numbers) {
        row.insert("embryo_number", Value::from(number));
    }
    table.ensure_column("embryo_number");
}

/// DateOfBirth → YearOfBirth
pub fn add_year_of_birth(table: &mut Table) {
    for row in table.rows.iter_mut() {
        let year = row
            .text("DateOfBirth")
            .and_then(|d| parse_date(d.get(..10).unwrap_or(d.as_str())))
            .map(|d| Value::from(d.year()))
            .unwrap_or(Value::Null);
        row.insert("YearOfBirth", year);
    }
    table.ensure_column("YearOfBirth");
}
