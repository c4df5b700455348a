//! SQLite store adapter

use super::StoreConfig;
use crate::etl::{Order, Query, RecordStream, Selector, Store, StoreError};
use crate::schema::{Record, Row, TableSchema};
use async_trait::async_trait;
use eyre::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params_from_iter};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};

/// Rows buffered between the SQLite reader thread and the consumer
const READ_BUFFER: usize = 256;

/// Relational store backed by a single SQLite file
///
/// Every operation opens its own connection on a blocking thread and
/// closes it before returning.
pub struct SqliteStore {
    config: StoreConfig,
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(config: StoreConfig) -> Self {
        let path = PathBuf::from(&config.name);
        Self { config, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn is_constraint(error: &rusqlite::Error) -> bool {
    matches!(error, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn create_table_sql(schema: &TableSchema) -> String {
    let keys = schema.key_fields();
    // A lone INTEGER key becomes the rowid alias so null keys are assigned
    let inline_key = match keys.as_slice() {
        [key] => schema
            .field(key)
            .filter(|f| f.kind.sql_type() == "INTEGER")
            .map(|f| f.name.as_str()),
        _ => None,
    };

    let mut columns: Vec<String> = schema
        .fields
        .iter()
        .map(|f| {
            let mut column = format!("{} {}", quote(&f.name), f.kind.sql_type());
            if inline_key == Some(f.name.as_str()) {
                column.push_str(" PRIMARY KEY");
                if f.autoincrement {
                    column.push_str(" AUTOINCREMENT");
                }
            }
            column
        })
        .collect();

    if inline_key.is_none() && !keys.is_empty() {
        let keys: Vec<String> = keys.iter().map(|k| quote(k)).collect();
        columns.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&schema.name),
        columns.join(", ")
    )
}

/// `WHERE` clause and parameters for a selector
fn where_clause(selector: &Selector) -> (String, Vec<SqlValue>) {
    if selector.filters.is_empty() {
        return (String::new(), Vec::new());
    }
    let conditions: Vec<String> = selector
        .filters
        .iter()
        .enumerate()
        .map(|(i, (field, _))| format!("{} = ?{}", quote(field), i + 1))
        .collect();
    let params = selector.filters.iter().map(|(_, v)| to_sql(v)).collect();
    (format!(" WHERE {}", conditions.join(" AND ")), params)
}

fn select_sql(selector: &Selector) -> (String, Vec<SqlValue>) {
    let (filter, params) = where_clause(selector);
    let mut sql = format!("SELECT * FROM {}{}", quote(&selector.table), filter);
    if let Some((field, order)) = &selector.order_by {
        let direction = match order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {} {}", quote(field), direction));
    }
    if let Some(limit) = selector.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    (sql, params)
}

fn statement_for(query: Query, delete: bool) -> Result<(String, Vec<SqlValue>)> {
    match query {
        Query::Select(selector) if delete => {
            let (filter, params) = where_clause(&selector);
            Ok((format!("DELETE FROM {}{}", quote(&selector.table), filter), params))
        }
        Query::Select(selector) => Ok(select_sql(&selector)),
        Query::Sql { statement, params } => Ok((statement, params.iter().map(to_sql).collect())),
        Query::Search { .. } => Err(StoreError::UnsupportedQuery {
            backend: "sqlite",
            detail: "document search bodies need a document store".into(),
        }
        .into()),
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("SQLite worker thread failed")?
}

fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Connection::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn open_existing(path: &Path) -> Result<Connection> {
    if !path.is_file() {
        return Err(StoreError::MissingStore(path.display().to_string()).into());
    }
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn write_rows(
    path: &Path,
    rows: Vec<Row>,
    schema: &TableSchema,
    tolerate: bool,
) -> Result<Vec<Row>> {
    let mut conn = open(path)?;
    let tx = conn.transaction()?;
    let mut rejected = Vec::new();
    {
        let columns: Vec<String> = schema.field_names().map(quote).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&schema.name),
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut stmt = tx
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare insert into '{}'", schema.name))?;

        for row in rows {
            let values = row.clone().into_values(schema)?;
            match stmt.execute(params_from_iter(values.iter().map(to_sql))) {
                Ok(_) => {}
                Err(e) if is_constraint(&e) && tolerate => {
                    log::debug!("Rejected row in '{}': {}", schema.name, e);
                    rejected.push(row);
                }
                Err(e) if is_constraint(&e) => {
                    return Err(StoreError::Constraint {
                        table: schema.name.clone(),
                        detail: e.to_string(),
                    }
                    .into());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to insert into '{}'", schema.name));
                }
            }
        }
    }
    tx.commit()
        .with_context(|| format!("Failed to commit batch into '{}'", schema.name))?;
    Ok(rejected)
}

fn update_rows(
    path: &Path,
    rows: Vec<Record>,
    schema: &TableSchema,
    key_fields: &[String],
) -> Result<usize> {
    let mut conn = open_existing(path)?;
    let tx = conn.transaction()?;
    let mut changed = 0;
    for record in rows {
        let mut keys = Vec::with_capacity(key_fields.len());
        for key in key_fields {
            match record.get(key) {
                Some(value) if !value.is_null() => keys.push((key.as_str(), to_sql(value))),
                _ => bail!("Update of '{}' is missing key field '{}'", schema.name, key),
            }
        }
        let updates: Vec<(&str, SqlValue)> = record
            .iter()
            .filter(|(field, value)| !value.is_null() && !key_fields.iter().any(|k| k == *field))
            .map(|(field, value)| (field.as_str(), to_sql(value)))
            .collect();
        if updates.is_empty() {
            continue;
        }

        let assignments: Vec<String> = updates
            .iter()
            .enumerate()
            .map(|(i, (field, _))| format!("{} = ?{}", quote(field), i + 1))
            .collect();
        let conditions: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, (field, _))| format!("{} = ?{}", quote(field), updates.len() + i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote(&schema.name),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        let params = updates.into_iter().chain(keys).map(|(_, v)| v);
        changed += tx
            .execute(&sql, params_from_iter(params))
            .with_context(|| format!("Failed to update '{}'", schema.name))?;
    }
    tx.commit()?;
    Ok(changed)
}

fn stream_rows(
    path: &Path,
    sql: &str,
    params: Vec<SqlValue>,
    tx: &tokio::sync::mpsc::Sender<Result<Record>>,
) -> Result<()> {
    let conn = open_existing(path)?;
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("Failed to prepare query: {}", sql))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params_from_iter(params))?;
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (i, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sql(row.get::<_, SqlValue>(i)?));
        }
        if tx.blocking_send(Ok(record)).is_err() {
            // Consumer stopped reading
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn configure(&self, tables: &[TableSchema], force: bool) -> Result<()> {
        let path = self.path.clone();
        let tables = tables.to_vec();
        blocking(move || {
            let conn = open(&path)?;
            for table in &tables {
                if force {
                    log::info!("Dropping table '{}' in {}", table.name, path.display());
                    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote(&table.name)), [])?;
                }
                conn.execute(&create_table_sql(table), [])
                    .with_context(|| format!("Failed to create table '{}'", table.name))?;
            }
            Ok(())
        })
        .await
    }

    async fn has_table(&self, table: &str) -> Result<bool> {
        let path = self.path.clone();
        let table = table.to_string();
        blocking(move || {
            if !path.is_file() {
                return Ok(false);
            }
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&table],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn write(&self, rows: Vec<Row>, table: &TableSchema, tolerate: bool) -> Result<Vec<Row>> {
        let path = self.path.clone();
        let schema = table.clone();
        blocking(move || write_rows(&path, rows, &schema, tolerate)).await
    }

    async fn update(
        &self,
        rows: Vec<Record>,
        table: &TableSchema,
        key_fields: &[&str],
    ) -> Result<usize> {
        let path = self.path.clone();
        let schema = table.clone();
        let key_fields: Vec<String> = key_fields.iter().map(|k| k.to_string()).collect();
        blocking(move || update_rows(&path, rows, &schema, &key_fields)).await
    }

    async fn read(&self, query: Query) -> Result<RecordStream> {
        if !self.path.is_file() {
            return Err(StoreError::MissingStore(self.path.display().to_string()).into());
        }
        let (sql, params) = statement_for(query, false)?;
        let (tx, stream) = RecordStream::channel(READ_BUFFER);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_rows(&path, &sql, params, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(stream)
    }

    async fn delete(&self, query: Query) -> Result<u64> {
        let (sql, params) = statement_for(query, true)?;
        let path = self.path.clone();
        blocking(move || {
            let conn = open_existing(&path)?;
            let removed = conn
                .execute(&sql, params_from_iter(params))
                .with_context(|| format!("Failed to run delete: {}", sql))?;
            Ok(removed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnKind, FieldSpec};
    use serde_json::json;
    use tempfile::TempDir;

    fn letters() -> TableSchema {
        TableSchema::new(
            "letters",
            vec![
                FieldSpec::key("ID", ColumnKind::Integer),
                FieldSpec::new("Letter", ColumnKind::Text),
                FieldSpec::new("Number", ColumnKind::Real),
            ],
        )
    }

    fn store(temp: &TempDir) -> SqliteStore {
        SqliteStore::new(StoreConfig::sqlite(
            temp.path().join("nested/letters.sqlite").display().to_string(),
        ))
    }

    fn row(id: i64, letter: &str) -> Row {
        Row::Tuple(vec![json!(id), json!(letter), json!(1.5)])
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            create_table_sql(&letters()),
            "CREATE TABLE IF NOT EXISTS \"letters\" (\"ID\" INTEGER PRIMARY KEY, \"Letter\" TEXT, \"Number\" REAL)"
        );

        let composite = TableSchema::new(
            "pairs",
            vec![
                FieldSpec::key("a", ColumnKind::Text),
                FieldSpec::key("b", ColumnKind::Integer),
            ],
        );
        assert!(create_table_sql(&composite).ends_with("PRIMARY KEY (\"a\", \"b\"))"));
    }

    #[tokio::test]
    async fn test_has_table_does_not_create_store() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        assert!(!store.has_table("letters").await.unwrap());
        assert!(!store.path().exists());

        store.configure(&[letters()], false).await.unwrap();
        assert!(store.has_table("letters").await.unwrap());
        assert!(!store.has_table("numbers").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();

        let mut keyed = Record::new();
        keyed.insert("ID".into(), json!(2));
        keyed.insert("Letter".into(), json!("B"));
        store
            .write(vec![row(1, "A"), Row::Keyed(keyed)], &letters(), false)
            .await
            .unwrap();

        let records = store
            .read(Selector::table("letters").order_by("ID", Order::Desc).into())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Letter"], json!("B"));
        assert_eq!(records[0]["Number"], Value::Null);
        assert_eq!(records[1]["Number"], json!(1.5));
    }

    #[tokio::test]
    async fn test_constraint_fails_whole_batch() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();

        let err = store
            .write(vec![row(1, "A"), row(1, "B")], &letters(), false)
            .await
            .unwrap_err();
        assert!(crate::etl::is_constraint(&err));

        let records = store
            .read(Selector::table("letters").into())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_tolerated_rejections_are_returned() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();

        let rejected = store
            .write(vec![row(1, "A"), row(1, "B"), row(2, "C")], &letters(), true)
            .await
            .unwrap();
        assert_eq!(rejected, vec![row(1, "B")]);
    }

    #[tokio::test]
    async fn test_null_integer_key_is_assigned() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();

        let rows = vec![
            Row::Tuple(vec![Value::Null, json!("A"), Value::Null]),
            Row::Tuple(vec![Value::Null, json!("B"), Value::Null]),
        ];
        store.write(rows, &letters(), false).await.unwrap();

        let records = store
            .read(Selector::table("letters").order_by("ID", Order::Asc).into())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records[0]["ID"], json!(1));
        assert_eq!(records[1]["ID"], json!(2));
    }

    #[tokio::test]
    async fn test_update_skips_null_fields() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();
        store.write(vec![row(1, "A")], &letters(), false).await.unwrap();

        let mut update = Record::new();
        update.insert("ID".into(), json!(1));
        update.insert("Letter".into(), Value::Null);
        update.insert("Number".into(), json!(9.0));
        let changed = store.update(vec![update], &letters(), &["ID"]).await.unwrap();
        assert_eq!(changed, 1);

        let records = store
            .read(Selector::table("letters").eq("ID", 1).into())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records[0]["Letter"], json!("A"));
        assert_eq!(records[0]["Number"], json!(9.0));
    }

    #[tokio::test]
    async fn test_delete_and_force() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();
        store
            .write(vec![row(1, "A"), row(2, "B")], &letters(), false)
            .await
            .unwrap();

        let removed = store
            .delete(Selector::table("letters").eq("Letter", "A").into())
            .await
            .unwrap();
        assert_eq!(removed, 1);

        store.configure(&[letters()], true).await.unwrap();
        let records = store
            .read(Query::Sql {
                statement: "SELECT COUNT(*) AS n FROM letters".into(),
                params: vec![],
            })
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records[0]["n"], json!(0));
    }

    #[tokio::test]
    async fn test_read_missing_store() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let err = store
            .read(Selector::table("letters").into())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::MissingStore(_))
        ));
    }

    #[tokio::test]
    async fn test_search_queries_are_unsupported() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.configure(&[letters()], false).await.unwrap();
        let err = store
            .delete(Query::Search {
                table: "letters".into(),
                body: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnsupportedQuery { .. })
        ));
    }
}
