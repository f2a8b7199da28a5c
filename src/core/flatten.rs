//! Embryoscope JSON 攤平

use crate::core::casting::{to_date_value, to_datetime_value, to_float_value};
use crate::domain::model::{Record, Table};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

pub const META_COLUMNS: [&str; 4] = ["_extraction_timestamp", "_location", "_run_id", "_row_hash"];

const ANNOTATION_FIELDS: [&str; 4] = ["Name", "Time", "Value", "Timestamp"];

/// KID 評分欄位改名
const EVALUATION_RENAMES: [(&str, &str); 4] = [
    ("Evaluation_Evaluation", "KIDScore"),
    ("Evaluation_EvaluationDate", "KIDDate"),
    ("Evaluation_Model", "KIDVersion"),
    ("Evaluation_User", "KIDUser"),
];

const IDASCORE_RENAMES: [(&str, &str); 4] = [
    ("Viability", "IDAScore"),
    ("Time", "IDATime"),
    ("Version", "IDAVersion"),
    ("Timestamp", "IDATimestamp"),
];

pub const IDASCORE_COLUMNS: [&str; 5] = ["EmbryoID", "IDAScore", "IDATime", "IDAVersion", "IDATimestamp"];

/// 收集所有胚胎的 annotation 名稱
pub fn annotation_names<'a>(embryos: impl IntoIterator<Item = &'a Value>) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for embryo in embryos {
        if let Some(list) = embryo.get("AnnotationList").and_then(Value::as_array) {
            for annotation in list {
                if let Some(name) = annotation.get("Name").and_then(Value::as_str) {
                    names.insert(name.to_string());
                }
            }
        }
    }
    names
}

/// 攤平單一胚胎
///
/// 巢狀物件展開為 `{key}_{subkey}`；AnnotationList 依名稱樞紐為
/// `{field}_{name}`，缺少的 annotation 以 null 補齊。
pub fn flatten_embryo(embryo: &Value, names: &BTreeSet<String>) -> Record {
    let mut flat = Record::new();
    let obj = match embryo.as_object() {
        Some(obj) => obj,
        None => return flat,
    };

    for (key, value) in obj {
        match value {
            Value::Object(inner) => {
                for (sub_key, sub_value) in inner {
                    flat.insert(format!("{}_{}", key, sub_key), sub_value.clone());
                }
            }
            Value::Array(_) if key == "AnnotationList" => {}
            other => flat.insert(key.clone(), other.clone()),
        }
    }

    let annotations: &[Value] = obj
        .get("AnnotationList")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for name in names {
        let found = annotations
            .iter()
            .find(|a| a.get("Name").and_then(Value::as_str) == Some(name.as_str()));
        match found.and_then(Value::as_object) {
            Some(annotation) => {
                for (field, value) in annotation {
                    flat.insert(format!("{}_{}", field, name), value.clone());
                }
            }
            None => {
                for field in ANNOTATION_FIELDS {
                    flat.insert(format!("{}_{}", field, name), Value::Null);
                }
            }
        }
    }

    flat
}

/// `Time_*` 轉數值，其餘 *Date / *Time / *Timestamp 轉日期時間
pub fn cast_embryo_types(record: &mut Record) {
    for (column, value) in record.data.iter_mut() {
        if column.starts_with("Time_") {
            *value = to_float_value(value);
        } else if column.ends_with("Date") || column.ends_with("Time") || column.ends_with("Timestamp") {
            *value = to_datetime_value(value);
        }
    }
}

pub fn rename_embryo_columns(record: &mut Record) {
    for (from, to) in EVALUATION_RENAMES {
        if let Some(value) = record.remove(from) {
            record.insert(to, value);
        }
    }

    let prefixed: Vec<String> = record
        .data
        .keys()
        .filter(|k| k.starts_with("EmbryoDetails_"))
        .cloned()
        .collect();
    for column in prefixed {
        if let Some(value) = record.remove(&column) {
            let stripped = column.trim_start_matches("EmbryoDetails_").to_string();
            record.insert(stripped, value);
        }
    }
}

pub fn rename_idascore(score: &Value) -> Record {
    let mut record = Record::new();
    if let Some(obj) = score.as_object() {
        for (key, value) in obj {
            let target = IDASCORE_RENAMES
                .iter()
                .find(|(from, _)| from == key)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| key.clone());
            record.insert(target, value.clone());
        }
    }
    record
}

/// EmbryoID, PatientIDx, TreatmentName, KID*, IDA*, 其他 (排序)，最後是中繼欄位
pub fn order_embryo_columns(columns: &[String]) -> Vec<String> {
    let main = ["EmbryoID", "PatientIDx", "TreatmentName"];
    let present: HashSet<&str> = columns.iter().map(String::as_str).collect();

    let mut ordered: Vec<String> = main
        .iter()
        .filter(|c| present.contains(*c))
        .map(|c| c.to_string())
        .collect();

    let mut kid: Vec<String> = columns.iter().filter(|c| c.starts_with("KID")).cloned().collect();
    let mut ida: Vec<String> = columns.iter().filter(|c| c.starts_with("IDA")).cloned().collect();
    let mut rest: Vec<String> = columns
        .iter()
        .filter(|c| {
            !main.contains(&c.as_str())
                && !c.starts_with("KID")
                && !c.starts_with("IDA")
                && !META_COLUMNS.contains(&c.as_str())
        })
        .cloned()
        .collect();
    kid.sort();
    ida.sort();
    rest.sort();

    ordered.extend(kid);
    ordered.extend(ida);
    ordered.extend(rest);
    ordered.extend(META_COLUMNS.iter().map(|c| c.to_string()));
    ordered
}

/// 從 EmbryoID 擷取日期 (例如 D2023.04.12_S0001_I3027_P-1 → 2023-04-12)
pub fn embryo_date(embryo_id: &str, pattern: &Regex) -> Option<String> {
    let found = pattern.find(embryo_id)?;
    match to_date_value(&Value::String(found.as_str().to_string())) {
        Value::String(s) => Some(s),
        _ => None,
    }
}

pub fn embryo_date_regex() -> Result<Regex, regex::Error> {
    Regex::new(r"20\d{2}\.\d{2}\.\d{2}")
}

/// 填值率統計：空字串與 "NULL"/"None" 也算空
pub fn fill_rate(table: &Table, column: &str) -> f64 {
    if table.rows.is_empty() {
        return 0.0;
    }
    let filled = table
        .rows
        .iter()
        .filter(|row| match row.get(column) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => {
                let t = s.trim();
                !(t.is_empty() || matches!(t, "NULL" | "null" | "None" | "none"))
            }
            Some(_) => true,
        })
        .count();
    filled as f64 * 100.0 / table.rows.len() as f64
}

/// 移除空值率超過門檻的欄位，回傳被移除的欄位與其空值率
pub fn drop_sparse_columns(table: &mut Table, null_rate_threshold: f64, keep: &[&str]) -> Vec<(String, f64)> {
    if table.rows.is_empty() {
        return Vec::new();
    }

    let mut dropped = Vec::new();
    let mut kept = Vec::new();
    for column in &table.columns {
        let null_rate = 100.0 - fill_rate(table, column);
        if null_rate > null_rate_threshold && !keep.contains(&column.as_str()) {
            dropped.push((column.clone(), null_rate));
        } else {
            kept.push(column.clone());
        }
    }

    if !dropped.is_empty() {
        for row in table.rows.iter_mut() {
            for (column, _) in &dropped {
                row.remove(column);
            }
        }
        table.columns = kept;
    }
    dropped.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_embryo() -> Value {
        json!({
            "EmbryoID": "D2023.04.12_S0001_I3027_P-3",
            "EmbryoDetails": {"WellNumber": 3, "FertilizationTime": "2023-04-11T10:30:00"},
            "Evaluation": {"Evaluation": "5.2", "Model": "KIDScore D5 v3", "EvaluationDate": "2023-04-16T09:00:00"},
            "AnnotationList": [
                {"Name": "tPNf", "Time": "20.5", "Value": "", "Timestamp": "2023-04-12T07:00:00"}
            ]
        })
    }

    #[test]
    fn test_flatten_pivots_annotations_and_fills_missing() {
        let embryos = vec![
            sample_embryo(),
            json!({"EmbryoID": "E2", "AnnotationList": [{"Name": "t2", "Time": 25.1}]}),
        ];
        let names = annotation_names(&embryos);
        assert_eq!(names.iter().cloned().collect::<Vec<_>>(), vec!["t2", "tPNf"]);

        let flat = flatten_embryo(&embryos[0], &names);
        assert_eq!(flat.get("EmbryoDetails_WellNumber"), Some(&json!(3)));
        assert_eq!(flat.get("Time_tPNf"), Some(&json!("20.5")));
        assert_eq!(flat.get("Name_t2"), Some(&Value::Null));
        assert_eq!(flat.get("Timestamp_t2"), Some(&Value::Null));
        assert!(flat.get("AnnotationList").is_none());
    }

    #[test]
    fn test_cast_and_rename() {
        let names = annotation_names(std::iter::once(&sample_embryo()));
        let mut flat = flatten_embryo(&sample_embryo(), &names);
        flat.insert("ScanTimestamp", json!("2023-04-13T08:15:00"));
        cast_embryo_types(&mut flat);
        rename_embryo_columns(&mut flat);

        assert_eq!(flat.get("Time_tPNf"), Some(&json!(20.5)));
        // 前綴 Timestamp_ 不轉型，只有結尾為 Timestamp 的欄位才轉
        assert_eq!(flat.get("Timestamp_tPNf"), Some(&json!("2023-04-12T07:00:00")));
        assert_eq!(flat.get("ScanTimestamp"), Some(&json!("2023-04-13 08:15:00")));
        assert_eq!(flat.get("FertilizationTime"), Some(&json!("2023-04-11 10:30:00")));
        assert_eq!(flat.get("KIDScore"), Some(&json!("5.2")));
        assert_eq!(flat.get("KIDDate"), Some(&json!("2023-04-16 09:00:00")));
        assert_eq!(flat.get("KIDVersion"), Some(&json!("KIDScore D5 v3")));
        assert!(flat.get("Evaluation_Evaluation").is_none());
        assert!(flat.get("EmbryoDetails_WellNumber").is_none());
        assert_eq!(flat.get("WellNumber"), Some(&json!(3)));
    }

    #[test]
    fn test_order_columns() {
        let cols: Vec<String> = ["WellNumber", "_run_id", "KIDScore", "TreatmentName", "IDAScore", "EmbryoID", "KIDDate", "Name_t2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ordered = order_embryo_columns(&cols);
        assert_eq!(
            &ordered[..7],
            &["EmbryoID", "TreatmentName", "KIDDate", "KIDScore", "IDAScore", "Name_t2", "WellNumber"]
        );
        assert_eq!(&ordered[7..], &META_COLUMNS);
    }

    #[test]
    fn test_embryo_date_and_idascore_rename() {
        let re = embryo_date_regex().unwrap();
        assert_eq!(embryo_date("D2023.04.12_S0001_I3027_P-3", &re), Some("2023-04-12".to_string()));
        assert_eq!(embryo_date("no-date", &re), None);

        let rec = rename_idascore(&json!({"EmbryoID": "E1", "Viability": 0.8, "Time": 110.5}));
        assert_eq!(rec.get("IDAScore"), Some(&json!(0.8)));
        assert_eq!(rec.get("IDATime"), Some(&json!(110.5)));
    }

    #[test]
    fn test_drop_sparse_columns_keeps_protected() {
        let rows = (0..10)
            .map(|i| {
                let mut r = Record::new();
                r.insert("EmbryoID", json!(format!("E{}", i)));
                r.insert("Rare", if i == 0 { json!("x") } else { Value::Null });
                r.insert("PatientIDx", Value::Null);
                r
            })
            .collect();
        let mut table = Table::from_records("silver_embryo_data", rows);
        let dropped = drop_sparse_columns(&mut table, 85.0, &["PatientIDx"]);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, "Rare");
        assert!(table.has_column("PatientIDx"));
        assert!(!table.rows[0].data.contains_key("Rare"));
    }
}
