use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_PATTERNS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_PATTERNS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%d/%m/%Y", "%Y%m%d"];

const NULL_MARKERS: &[&str] = &[
    "", "NULL", "null", "None", "00/00/0000", "0000-00-00", "00/00/00", "0000/00/00",
];

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 寬鬆解析日期時間；只有日期時補 00:00:00
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for pattern in DATETIME_PATTERNS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(dt);
        }
    }
    parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_PATTERNS
        .iter()
        .find_map(|p| NaiveDate::parse_from_str(raw, p).ok())
}

/// 轉成 "YYYY-MM-DD HH:MM:SS"；無法解析為 null
pub fn to_datetime_value(value: &Value) -> Value {
    match value {
        Value::String(s) => parse_datetime(s)
            .map(|dt| Value::String(dt.format(DATETIME_FORMAT).to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// 轉成 "YYYY-MM-DD"；接受日期或日期時間
pub fn to_date_value(value: &Value) -> Value {
    match value {
        Value::String(s) => parse_datetime(s)
            .map(|dt| Value::String(dt.date().format(DATE_FORMAT).to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn to_float_value(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Value::Bool(b) => Value::from(if *b { 1.0 } else { 0.0 }),
        _ => Value::Null,
    }
}

pub fn to_int_value(value: &Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Value::from)
            .unwrap_or(Value::Null),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .map(Value::from)
                .unwrap_or(Value::Null)
        }
        Value::Bool(b) => Value::from(i64::from(*b)),
        _ => Value::Null,
    }
}

pub fn to_text_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(_) => value.clone(),
        other => crate::domain::model::value_to_text(other)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// 只保留 [0-9,.]，逗號當小數點
fn numeric_chars(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect()
}

/// 巴西貨幣格式 "1.234,56" → 1234.56
pub fn parse_currency(value: &Value) -> Value {
    match text_of(value) {
        Some(raw) if !raw.is_empty() => {
            to_float_value(&Value::String(raw.replace('.', "").replace(',', ".")))
        }
        _ => Value::Null,
    }
}

/// 體重/身高："1,65m" → 1.65、"70 kg" → 70
pub fn parse_measure(value: &Value) -> Value {
    if let Value::Number(_) = value {
        return value.clone();
    }
    match text_of(value) {
        Some(raw) if !NULL_MARKERS.contains(&raw.as_str()) => {
            let kept = numeric_chars(&raw);
            if kept.is_empty() {
                Value::Null
            } else {
                to_float_value(&Value::String(kept.replace(',', ".")))
            }
        }
        _ => Value::Null,
    }
}

/// 劑量："1.000,5 UI" → 1000.5
pub fn parse_dose(value: &Value) -> Value {
    if let Value::Number(_) = value {
        return value.clone();
    }
    match text_of(value) {
        Some(raw) => {
            let kept = numeric_chars(&raw).replace('.', "").replace(',', ".");
            if kept.is_empty() {
                Value::Null
            } else {
                to_float_value(&Value::String(kept))
            }
        }
        None => Value::Null,
    }
}

/// Clinisys 欄位型別規則
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    ExtractionTimestamp,
    Date,
    Time,
    Int,
    Prontuario,
    Currency,
    Measure,
    Float,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColumnRules {
    pub date_columns: Vec<String>,
    pub time_columns: Vec<String>,
    pub int_columns: Vec<String>,
    pub float_columns: Vec<String>,
    pub currency_columns: Vec<String>,
    pub measure_columns: Vec<String>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for ColumnRules {
    fn default() -> Self {
        Self {
            date_columns: owned(&[
                "data", "data_inicial", "data_final", "Data", "DataCongelamento",
                "DataDescongelamento", "DataTransferencia", "data_entrega", "data_pagamento",
                "data_entrega_orcamento", "data_ultima_modificacao", "data_agendamento_original",
                "responsavel_recebimento_data", "responsavel_armazenamento_data", "Data_DL",
                "data_procedimento", "data_transferencia", "data_dum",
            ]),
            time_columns: owned(&["hora", "Hora", "inicio"]),
            int_columns: owned(&[
                "id", "codigo", "prontuario", "ficha_id", "quantidade", "duracao",
                "registro", "unidade_origem", "idade_esposa", "NEmbrioes",
                "NOvulos", "doadora", "Transferencia", "Prateleira", "responsavel_recebimento",
                "responsavel_armazenamento", "BiologoResponsavel", "responsavel_congelamento_d5",
                "responsavel_checagem_d5", "responsavel_congelamento_d6", "responsavel_checagem_d6",
                "responsavel_congelamento_d7", "responsavel_checagem_d7", "id_oocito",
                "id_congelamento", "id_descongelamento", "agendamento_id", "medico", "medico2",
                "evento", "centro_custos", "agenda", "confirmado", "paciente_codigo",
                "codigo_ficha", "IdadeEsposa_DG", "id_micromanipulacao", "inativo",
            ]),
            float_columns: owned(&[
                "rqe", "intervalo", "ovulo", "d2", "d3", "d4", "d5", "d6", "d7", "rack2", "rack3",
                "rack4", "responsavel_transferencia",
            ]),
            currency_columns: owned(&["valor"]),
            measure_columns: owned(&[
                "peso_paciente", "altura_paciente", "peso_conjuge", "altura_conjuge", "peso",
                "altura",
            ]),
        }
    }
}

/// 小寫化後的查表結構
#[derive(Debug, Clone)]
pub struct ColumnClassifier {
    date: HashSet<String>,
    time: HashSet<String>,
    int: HashSet<String>,
    float: HashSet<String>,
    currency: HashSet<String>,
    measure: HashSet<String>,
}

fn lower_set(names: &[String]) -> HashSet<String> {
    names.iter().map(|n| n.to_lowercase()).collect()
}

impl ColumnClassifier {
    pub fn new(rules: &ColumnRules) -> Self {
        Self {
            date: lower_set(&rules.date_columns),
            time: lower_set(&rules.time_columns),
            int: lower_set(&rules.int_columns),
            float: lower_set(&rules.float_columns),
            currency: lower_set(&rules.currency_columns),
            measure: lower_set(&rules.measure_columns),
        }
    }

    pub fn kind(&self, column: &str) -> ColumnKind {
        if column == "extraction_timestamp" {
            return ColumnKind::ExtractionTimestamp;
        }
        let lower = column.to_lowercase();
        if self.date.contains(&lower) {
            ColumnKind::Date
        } else if self.time.contains(&lower) {
            ColumnKind::Time
        } else if self.int.contains(&lower) {
            if lower == "prontuario" {
                ColumnKind::Prontuario
            } else {
                ColumnKind::Int
            }
        } else if self.currency.contains(&lower) {
            ColumnKind::Currency
        } else if self.measure.contains(&lower) {
            ColumnKind::Measure
        } else if self.float.contains(&lower) {
            ColumnKind::Float
        } else {
            ColumnKind::Text
        }
    }
}

/// Clinisys 日期：dd/mm/YYYY (或 ISO)，未來日期與 1900..=2030 以外的年份視為無效
pub fn clinisys_date(value: &Value, today: NaiveDate) -> Value {
    let raw = match text_of(value) {
        Some(raw) if !NULL_MARKERS.contains(&raw.as_str()) => raw,
        _ => return Value::Null,
    };
    let date = NaiveDate::parse_from_str(&raw, "%d/%m/%Y")
        .ok()
        .or_else(|| parse_datetime(&raw).map(|dt| dt.date()));
    match date {
        Some(d) if d <= today && (1900..=2030).contains(&d.year()) => {
            Value::String(d.format(DATE_FORMAT).to_string())
        }
        _ => Value::Null,
    }
}

pub fn clinisys_time(value: &Value) -> Value {
    let raw = match text_of(value) {
        Some(raw) if !NULL_MARKERS.contains(&raw.as_str()) => raw,
        _ => return Value::Null,
    };
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
        .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
        .unwrap_or(Value::Null)
}

/// bronze 的 "%Y%m%d_%H%M%S"；未來時間視為無效
pub fn extraction_timestamp(value: &Value, now: NaiveDateTime) -> Value {
    let raw = match text_of(value) {
        Some(raw) => raw,
        None => return Value::Null,
    };
    NaiveDateTime::parse_from_str(&raw, "%Y%m%d_%H%M%S")
        .ok()
        .or_else(|| parse_datetime(&raw))
        .filter(|ts| *ts <= now)
        .map(|ts| Value::String(ts.format(DATETIME_FORMAT).to_string()))
        .unwrap_or(Value::Null)
}

pub fn cast_clinisys_value(kind: ColumnKind, value: &Value, now: NaiveDateTime) -> Value {
    match kind {
        ColumnKind::ExtractionTimestamp => extraction_timestamp(value, now),
        ColumnKind::Date => clinisys_date(value, now.date()),
        ColumnKind::Time => clinisys_time(value),
        ColumnKind::Int => to_int_value(value),
        ColumnKind::Prontuario | ColumnKind::Text => to_text_value(value),
        ColumnKind::Currency => parse_currency(value),
        ColumnKind::Measure => parse_measure(value),
        ColumnKind::Float => to_float_value(value),
    }
}
