use crate::core::casting::{DATETIME_FORMAT, DATE_FORMAT};
use crate::domain::model::{Record, Table};
use crate::domain::ports::ClinisysSource;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use std::time::Duration;

/// Clinisys MySQL 來源
pub struct MySqlClinisysSource {
    pool: MySqlPool,
}

impl MySqlClinisysSource {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(connection_string)
            .await
            .map_err(|e| EtlError::SourceError {
                message: format!("Failed to connect to Clinisys MySQL: {}", e),
            })?;
        tracing::info!("✅ Connected to Clinisys MySQL");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_column(row: &MySqlRow, index: usize) -> Value {
    let type_name = row.columns()[index].type_info().name().to_uppercase();

    let decoded = match type_name.as_str() {
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .map(|v| v.map(|d| Value::from(d.format(DATE_FORMAT).to_string()))),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map(|d| Value::from(d.format(DATETIME_FORMAT).to_string()))),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)
            .map(|v| v.map(|t| Value::from(t.format("%H:%M:%S").to_string()))),
        "BIGINT UNSIGNED" | "INT UNSIGNED" | "MEDIUMINT UNSIGNED" | "SMALLINT UNSIGNED"
        | "TINYINT UNSIGNED" => row
            .try_get::<Option<u64>, _>(index)
            .map(|v| v.map(Value::from)),
        "BIGINT" | "INT" | "MEDIUMINT" | "SMALLINT" | "TINYINT" | "YEAR" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map(Value::from)),
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map(Value::from)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            tracing::debug!(
                "Column {} ({}) not decodable, stored as null: {}",
                row.columns()[index].name(),
                type_name,
                e
            );
            Value::Null
        }
    }
}

#[async_trait]
impl ClinisysSource for MySqlClinisysSource {
    async fn fetch_table(&self, name: &str, query: &str) -> Result<Table> {
        tracing::debug!("📥 Querying Clinisys {}: {}", name, query);
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EtlError::SourceError {
                message: format!("Query for {} failed: {}", name, e),
            })?;

        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => Vec::new(),
        };

        let mut table = Table::new(name, columns.clone());
        for row in &rows {
            let record = Record::from_pairs(
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| (column.clone(), decode_column(row, i))),
            );
            table.push(record);
        }

        tracing::info!("📥 Read {} rows from MySQL table {}", table.len(), name);
        Ok(table)
    }
}
