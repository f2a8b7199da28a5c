use serde_json::Value;

fn parse_digits(s: &str) -> Option<i64> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse::<i64>().ok().filter(|v| *v != 0)
}

fn whole_float(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f != 0.0 {
        Some(f as i64)
    } else {
        None
    }
}

/// Embryoscope 的 PatientID 正規化
///
/// "520.124" → 520124、"520124" → 520124；0 或非數字視為無效。
pub fn clean_patient_id(value: &Value) -> Option<i64> {
    match value {
        Value::Null => None,
        Value::Number(n) => match n.as_i64() {
            Some(i) if i != 0 => Some(i),
            Some(_) => None,
            None => n.as_f64().and_then(whole_float),
        },
        Value::String(s) => {
            let s = s.trim();
            if s.contains('.') {
                parse_digits(&s.replace('.', ""))
            } else {
                parse_digits(s)
            }
        }
        _ => None,
    }
}

/// Clinisys prontuario 正規化
///
/// 與 PatientID 的差異：帶小數的浮點數無效，以 ".0" 結尾的字串不去點。
pub fn clean_prontuario(value: &Value) -> Option<i64> {
    match value {
        Value::Null => None,
        Value::Number(n) => match n.as_i64() {
            Some(i) if i != 0 => Some(i),
            Some(_) => None,
            None => {
                let f = n.as_f64()?;
                let result = whole_float(f);
                if result.is_none() && f.fract() != 0.0 {
                    tracing::warn!("Unexpected decimal value in prontuario: {}", f);
                }
                result
            }
        },
        Value::String(s) => {
            let s = s.trim();
            if let Some(v) = parse_digits(s) {
                return Some(v);
            }
            if s.contains('.') && !s.ends_with(".0") {
                return parse_digits(&s.replace('.', ""));
            }
            None
        }
        _ => None,
    }
}
