use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// 一列動態資料：欄名 → JSON 值
///
/// 使用 BTreeMap 讓序列化結果固定排序，雜湊才會穩定。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self {
            data: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// JSON 物件轉成 Record；非物件回傳 None
    pub fn from_json_object(value: &Value) -> Option<Self> {
        value.as_object().map(|obj| Self {
            data: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.data.insert(column.into(), value);
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.data.remove(column)
    }

    pub fn is_null(&self, column: &str) -> bool {
        matches!(self.data.get(column), None | Some(Value::Null))
    }

    /// 取文字表示；數字與布林也轉成字串
    pub fn text(&self, column: &str) -> Option<String> {
        self.data.get(column).and_then(value_to_text)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        match self.data.get(column)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        match self.data.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// 具欄位順序的資料表，對應 lake 中的一張表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// 依首次出現順序收集欄位
    pub fn from_records(name: impl Into<String>, rows: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for row in &rows {
            for key in row.data.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn ensure_column(&mut self, column: &str) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
    }

    pub fn push(&mut self, row: Record) {
        for key in row.data.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }
}

/// 單一階段的執行結果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub rows_read: usize,
    pub rows_written: usize,
    pub tables: Vec<String>,
    pub outputs: Vec<String>,
    pub duration_ms: u64,
    pub metadata: serde_json::Map<String, Value>,
}

impl StageReport {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// 階段之間共享的執行上下文
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub execution_id: String,
    pub previous_reports: Vec<StageReport>,
    pub shared_data: HashMap<String, Value>,
}

impl StageContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            ..Self::default()
        }
    }

    pub fn report_by_stage(&self, stage: &str) -> Option<&StageReport> {
        self.previous_reports.iter().find(|r| r.stage == stage)
    }

    pub fn last_report(&self) -> Option<&StageReport> {
        self.previous_reports.last()
    }

    pub fn set_shared(&mut self, key: &str, value: Value) {
        self.shared_data.insert(key.to_string(), value);
    }

    pub fn shared(&self, key: &str) -> Option<&Value> {
        self.shared_data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_accessors() {
        let record = Record::from_pairs([
            ("PatientID", json!("520124")),
            ("Weight", json!(61.5)),
            ("Count", json!(3.0)),
            ("Missing", Value::Null),
        ]);
        assert_eq!(record.int("PatientID"), Some(520124));
        assert_eq!(record.float("Weight"), Some(61.5));
        assert_eq!(record.int("Count"), Some(3));
        assert!(record.is_null("Missing"));
        assert!(record.is_null("Absent"));
        assert_eq!(record.text("Weight"), Some("61.5".to_string()));
    }

    #[test]
    fn test_table_column_order_follows_first_seen() {
        let mut first = Record::new();
        first.insert("b", json!(1));
        first.insert("a", json!(2));
        let mut second = Record::new();
        second.insert("c", json!(3));

        let mut table = Table::from_records("t", vec![first]);
        table.push(second);
        // BTreeMap 內部排序，故首列為 a, b
        assert_eq!(table.columns, vec!["a", "b", "c"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_context_lookup() {
        let mut ctx = StageContext::new("exec-1");
        ctx.previous_reports.push(StageReport::new("extract"));
        ctx.previous_reports.push(StageReport::new("combine"));
        assert!(ctx.report_by_stage("extract").is_some());
        assert_eq!(ctx.last_report().map(|r| r.stage.as_str()), Some("combine"));
    }
}
