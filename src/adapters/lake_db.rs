use crate::domain::model::{Record, Table};
use crate::utils::error::{EtlError, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// 本地分析資料庫 (SQLite)
///
/// 欄位一律不宣告型別，值依 JSON 型別對應到 INTEGER / REAL / TEXT。
pub struct LakeDb {
    conn: Connection,
    path: Option<PathBuf>,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn create_or_extend(conn: &Connection, table: &str, columns: &[String]) -> Result<()> {
    if columns.is_empty() {
        return Ok(());
    }

    let existing = table_columns(conn, None, table)?;
    if existing.is_empty() {
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote_ident(table),
            cols.join(", ")
        ))?;
        return Ok(());
    }

    // SQLite 欄名不分大小寫
    let known: HashSet<String> = existing.iter().map(|c| c.to_lowercase()).collect();
    for column in columns {
        if !known.contains(&column.to_lowercase()) {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {};",
                quote_ident(table),
                quote_ident(column)
            ))?;
        }
    }
    Ok(())
}

fn insert_rows(conn: &Connection, table: &str, columns: &[String], rows: &[Record]) -> Result<usize> {
    if rows.is_empty() || columns.is_empty() {
        return Ok(0);
    }

    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        cols.join(", "),
        placeholders
    );

    let mut stmt = conn.prepare(&sql)?;
    for row in rows {
        let values = columns
            .iter()
            .map(|c| row.get(c).map(to_sql_value).unwrap_or(SqlValue::Null));
        stmt.execute(params_from_iter(values))?;
    }
    Ok(rows.len())
}

fn table_columns(conn: &Connection, schema: Option<&str>, table: &str) -> Result<Vec<String>> {
    let sql = match schema {
        Some(s) => format!("PRAGMA {}.table_info({})", quote_ident(s), quote_ident(table)),
        None => format!("PRAGMA table_info({})", quote_ident(table)),
    };
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

impl LakeDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.table_exists_in("main", table)
    }

    pub fn table_exists_in(&self, schema: &str, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            quote_ident(schema)
        );
        let count: i64 = self.conn.query_row(&sql, params![table], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names.into_iter().filter(|n| n.starts_with(prefix)).collect())
    }

    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        table_columns(&self.conn, None, table)
    }

    pub fn columns_in(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        table_columns(&self.conn, Some(schema), table)
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn ensure_table(&self, table: &str, columns: &[String]) -> Result<()> {
        create_or_extend(&self.conn, table, columns)
    }

    /// 追加資料列，必要時建表或補欄位；單一交易
    pub fn append_rows(&self, table: &str, columns: &[String], rows: &[Record]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        create_or_extend(&tx, table, columns)?;
        let inserted = insert_rows(&tx, table, columns, rows)?;
        tx.commit()?;
        Ok(inserted)
    }

    pub fn append_table(&self, table: &Table) -> Result<usize> {
        self.append_rows(&table.name, &table.columns, &table.rows)
    }

    /// 整張表重建
    pub fn replace_table(&self, table: &Table) -> Result<usize> {
        if table.columns.is_empty() {
            return Err(EtlError::ProcessingError {
                message: format!("Cannot create table {} without columns", table.name),
            });
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(&table.name)))?;
        create_or_extend(&tx, &table.name, &table.columns)?;
        let inserted = insert_rows(&tx, &table.name, &table.columns, &table.rows)?;
        tx.commit()?;
        Ok(inserted)
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(table)))?;
        Ok(())
    }

    pub fn query_table(&self, name: &str, sql: &str, params: &[SqlValue]) -> Result<Table> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut table = Table::new(name, columns);
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (idx, column) in table.columns.iter().enumerate() {
                record.insert(column.clone(), from_sql_value(row.get_ref(idx)?));
            }
            table.rows.push(record);
        }
        Ok(table)
    }

    pub fn query_records(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>> {
        Ok(self.query_table("query", sql, params)?.rows)
    }

    pub fn read_table(&self, table: &str) -> Result<Table> {
        self.query_table(table, &format!("SELECT * FROM {}", quote_ident(table)), &[])
    }

    /// 第一欄的非空文字值集合
    pub fn text_set(&self, sql: &str, params: &[SqlValue]) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = HashSet::new();
        while let Some(row) = rows.next()? {
            if let Some(text) = crate::domain::model::value_to_text(&from_sql_value(row.get_ref(0)?)) {
                out.insert(text);
            }
        }
        Ok(out)
    }

    pub fn scalar_i64(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(sql, params_from_iter(params.iter()), |row| row.get::<_, Option<i64>>(0))?;
        Ok(value)
    }

    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn attach<P: AsRef<Path>>(&self, path: P, alias: &str) -> Result<()> {
        let path = path.as_ref().to_string_lossy().to_string();
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(alias)),
            params![path],
        )?;
        Ok(())
    }

    pub fn detach(&self, alias: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DETACH DATABASE {};", quote_ident(alias)))?;
        Ok(())
    }
}
