//! 门店存储
//!
//! OutletStore 只执行已通过闸门的 SqlCandidate；SqliteOutletStore 基于 rusqlite，
//! 在 spawn_blocking 中执行，按命名参数绑定，截断行数并只保留白名单列。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::sql_gate::SqlCandidate;
use crate::tools::text2sql::OUTLET_COLUMNS;

/// 查询结果中的一行（列名 -> 值）
pub type OutletRow = Map<String, Value>;

#[async_trait]
pub trait OutletStore: Send + Sync {
    async fn execute(&self, candidate: &SqlCandidate, max_rows: usize) -> Result<Vec<OutletRow>, ToolError>;
}

/// 一条门店记录（写入用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutletRecord {
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub address: Option<String>,
    pub open_time: Option<String>,
    pub close_time: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS outlets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    city TEXT,
    state TEXT,
    postal_code TEXT,
    address TEXT,
    open_time TEXT,
    close_time TEXT,
    services TEXT
)";

pub struct SqliteOutletStore {
    conn: Arc<Mutex<Connection>>,
}

fn storage_error(context: &str, err: impl std::fmt::Display) -> ToolError {
    tracing::error!(error = %err, "{context}");
    ToolError::Upstream("Failed to execute outlet query.".to_string())
}

impl SqliteOutletStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ToolError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            ToolError::ProviderUnavailable(format!("outlet database {}: {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ToolError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ToolError::ProviderUnavailable(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, ToolError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| ToolError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert(&self, outlet: &OutletRecord) -> Result<(), ToolError> {
        let services = serde_json::to_string(&outlet.services)
            .map_err(|e| storage_error("serialize services", e))?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO outlets (name, city, state, postal_code, address, open_time, close_time, services)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                outlet.name,
                outlet.city,
                outlet.state,
                outlet.postal_code,
                outlet.address,
                outlet.open_time,
                outlet.close_time,
                services,
            ],
        )
        .map_err(|e| storage_error("insert outlet", e))?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, ToolError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT COUNT(*) FROM outlets", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| storage_error("count outlets", e))
    }
}

fn to_json(column: &str, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).to_string();
            if column == "services" {
                if let Ok(list @ Value::Array(_)) = serde_json::from_str::<Value>(&text) {
                    return list;
                }
            }
            Value::String(text)
        }
        ValueRef::Blob(_) => Value::Null,
    }
}

fn run_query(conn: &Connection, candidate: &SqlCandidate, max_rows: usize) -> rusqlite::Result<Vec<OutletRow>> {
    let mut stmt = conn.prepare(&candidate.text)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_lowercase()).collect();
    let names: Vec<String> = candidate.params.keys().map(|k| format!(":{k}")).collect();
    let bindings: Vec<(&str, &dyn ToSql)> = names
        .iter()
        .zip(candidate.params.values())
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect();

    let mut rows = stmt.query(bindings.as_slice())?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (idx, column) in columns.iter().enumerate() {
            if OUTLET_COLUMNS.contains(&column.as_str()) {
                record.insert(column.clone(), to_json(column, row.get_ref(idx)?));
            }
        }
        out.push(record);
        if out.len() >= max_rows {
            break;
        }
    }
    Ok(out)
}

#[async_trait]
impl OutletStore for SqliteOutletStore {
    async fn execute(&self, candidate: &SqlCandidate, max_rows: usize) -> Result<Vec<OutletRow>, ToolError> {
        let conn = Arc::clone(&self.conn);
        let candidate = candidate.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            run_query(&conn, &candidate, max_rows).map_err(|e| storage_error("outlet query failed", e))
        })
        .await
        .map_err(|e| storage_error("outlet query task failed", e))?
    }
}
