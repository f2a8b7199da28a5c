use crate::domain::model::Record;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// 資料列雜湊：只看業務欄位，以 `_` 開頭的中繼欄位不參與
pub fn row_hash(record: &Record) -> String {
    let business: BTreeMap<&str, &Value> = record
        .data
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    let canonical = serde_json::to_string(&business).unwrap_or_default();
    sha256_hex(canonical.as_bytes())
}

/// 整批資料的指紋：排序後的列雜湊清單再雜湊一次
pub fn data_hash<I, S>(row_hashes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut hashes: Vec<String> = row_hashes.into_iter().map(Into::into).collect();
    if hashes.is_empty() {
        return sha256_hex(b"");
    }
    hashes.sort();
    let joined = serde_json::to_string(&hashes).unwrap_or_default();
    sha256_hex(joined.as_bytes())
}
