//! SQLite-backed document provider.
//!
//! Each collection is one two-column table (`id`, `doc`) where `doc` is the
//! serialized JSON document. Filters compile to `WHERE` clauses over the
//! JSON1 functions; list-valued fields are compared through their smallest
//! element via `json_each`, matching the in-memory provider exactly.

use std::sync::Mutex;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::debug;

use crate::document::Document;
use crate::error::Result;
use crate::filter::Filter;
use crate::provider::StorageProvider;

use async_trait::async_trait;

/// Document store over a single SQLite connection.
///
/// The connection is wrapped in a `Mutex`; operations are short single
/// statements, so one connection is sufficient for a single-node deployment.
pub struct SqliteProvider {
    conn: Mutex<Connection>,
}

impl SqliteProvider {
    /// Wrap an already-open connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    /// Create the collection table if it does not exist. Idempotent; called
    /// by every operation so collections appear on first touch.
    fn ensure_collection(conn: &Connection, collection: &str) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{collection}\" (
                id   TEXT NOT NULL PRIMARY KEY,
                doc  TEXT NOT NULL
            );"
        ))?;
        Ok(())
    }
}

#[async_trait]
impl<T: Document> StorageProvider<T> for SqliteProvider {
    async fn insert(&self, entity: &T) -> Result<()> {
        let doc = serde_json::to_string(entity)?;
        let conn = self.conn.lock().unwrap();
        Self::ensure_collection(&conn, T::COLLECTION)?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO \"{}\" (id, doc) VALUES (?, ?)", T::COLLECTION),
            rusqlite::params![entity.id(), doc],
        )?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_collection(&conn, T::COLLECTION)?;
        let row: Option<String> = match conn.query_row(
            &format!("SELECT doc FROM \"{}\" WHERE id = ?", T::COLLECTION),
            [id],
            |row| row.get(0),
        ) {
            Ok(doc) => Some(doc),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        match row {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<T>> {
        let mut params = Vec::new();
        let clause = compile(filter, &mut params);
        let conn = self.conn.lock().unwrap();
        Self::ensure_collection(&conn, T::COLLECTION)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT doc FROM \"{}\" WHERE {clause}",
            T::COLLECTION
        ))?;
        let docs: Vec<String> = stmt
            .query_map(params_from_iter(params), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(Into::into))
            .collect()
    }

    async fn find_first(&self, filter: &Filter, order_field: &str) -> Result<Option<T>> {
        let mut params = Vec::new();
        let clause = compile(filter, &mut params);
        let order = min_element_expr(order_field, &mut params);
        let conn = self.conn.lock().unwrap();
        Self::ensure_collection(&conn, T::COLLECTION)?;
        let row: Option<String> = match conn.query_row(
            &format!(
                "SELECT doc FROM \"{table}\" WHERE ({clause}) AND {order} IS NOT NULL
                 ORDER BY {order2} ASC LIMIT 1",
                table = T::COLLECTION,
                order2 = min_element_expr(order_field, &mut params),
            ),
            params_from_iter(params.clone()),
            |row| row.get(0),
        ) {
            Ok(doc) => Some(doc),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        match row {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    async fn conditional_update(
        &self,
        id: &str,
        field: &str,
        observed: Option<&Value>,
        new: &Value,
    ) -> Result<bool> {
        let path = json_path(field);
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(path.clone()),
            SqlValue::Text(new.to_string()),
            SqlValue::Text(id.to_string()),
        ];
        let guard = match observed {
            Some(value) => {
                params.push(SqlValue::Text(path.clone()));
                params.push(SqlValue::Text(value.to_string()));
                "json_extract(doc, ?) = json_extract(?, '$')".to_string()
            }
            None => {
                params.push(SqlValue::Text(path.clone()));
                params.push(SqlValue::Text(path));
                "(json_type(doc, ?) IS NULL OR json_type(doc, ?) = 'null')".to_string()
            }
        };
        let conn = self.conn.lock().unwrap();
        Self::ensure_collection(&conn, T::COLLECTION)?;
        let changed = conn.execute(
            &format!(
                "UPDATE \"{}\" SET doc = json_set(doc, ?, json(?)) WHERE id = ? AND {guard}",
                T::COLLECTION
            ),
            params_from_iter(params),
        )?;
        if changed == 0 {
            debug!(collection = T::COLLECTION, %id, %field, "conditional update matched no row");
        }
        Ok(changed == 1)
    }
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

/// SQL expression for a field's comparable value: the field itself for
/// scalars, the smallest element for arrays, NULL when missing or empty.
fn min_element_expr(field: &str, params: &mut Vec<SqlValue>) -> String {
    let path = json_path(field);
    params.push(SqlValue::Text(path.clone()));
    params.push(SqlValue::Text(path.clone()));
    params.push(SqlValue::Text(path));
    "(CASE json_type(doc, ?) WHEN 'array' \
      THEN (SELECT MIN(je.value) FROM json_each(doc, ?) AS je) \
      ELSE json_extract(doc, ?) END)"
        .to_string()
}

/// Compile a filter tree into a WHERE clause, appending bind parameters in
/// clause order.
fn compile(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::All => "1=1".to_string(),
        Filter::Eq { field, value } => {
            params.push(SqlValue::Text(json_path(field)));
            params.push(bind(value));
            "json_extract(doc, ?) = ?".to_string()
        }
        Filter::Lt { field, value } => {
            let expr = min_element_expr(field, params);
            params.push(bind(value));
            format!("{expr} < ?")
        }
        Filter::Gt { field, value } => {
            let expr = min_element_expr(field, params);
            params.push(bind(value));
            format!("{expr} > ?")
        }
        Filter::Exists { field, exists } => {
            let path = json_path(field);
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            if *exists {
                "(json_type(doc, ?) IS NOT NULL AND json_type(doc, ?) <> 'null')".to_string()
            } else {
                "(json_type(doc, ?) IS NULL OR json_type(doc, ?) = 'null')".to_string()
            }
        }
        Filter::And(children) => join(children, " AND ", "1=1", params),
        Filter::Or(children) => join(children, " OR ", "1=0", params),
    }
}

fn join(children: &[Filter], sep: &str, empty: &str, params: &mut Vec<SqlValue>) -> String {
    if children.is_empty() {
        return empty.to_string();
    }
    let clauses: Vec<String> = children.iter().map(|c| compile(c, params)).collect();
    format!("({})", clauses.join(sep))
}

/// Map a JSON scalar to a bindable SQLite value. Arrays and objects bind as
/// canonical JSON text (only meaningful for whole-value equality).
fn bind(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
