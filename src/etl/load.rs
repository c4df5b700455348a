//! Store adapter contract shared by every backend

use crate::schema::{Record, Row, TableSchema};
use crate::store::StoreConfig;
use async_trait::async_trait;
use eyre::Result;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error classes the loader reacts to
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend host could not be reached; retried once after a backoff
    #[error("Store host unreachable: {0}")]
    Unreachable(String),

    /// A row violated a uniqueness or integrity constraint
    #[error("Constraint violation in '{table}': {detail}")]
    Constraint { table: String, detail: String },

    #[error("{backend} store cannot run this query: {detail}")]
    UnsupportedQuery {
        backend: &'static str,
        detail: String,
    },

    #[error("Store '{0}' does not exist")]
    MissingStore(String),

    #[error("{0}")]
    Backend(String),
}

/// True when any error in the chain is [`StoreError::Unreachable`]
pub fn is_unreachable(error: &eyre::Report) -> bool {
    error
        .chain()
        .any(|e| matches!(e.downcast_ref::<StoreError>(), Some(StoreError::Unreachable(_))))
}

/// True when any error in the chain is [`StoreError::Constraint`]
pub fn is_constraint(error: &eyre::Report) -> bool {
    error
        .chain()
        .any(|e| matches!(e.downcast_ref::<StoreError>(), Some(StoreError::Constraint { .. })))
}

/// Run `op`, and once more after `backoff` if the host was unreachable
pub async fn retry_unreachable<T, F, Fut>(backoff: Duration, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if is_unreachable(&e) => {
            log::warn!(
                "{} could not reach the store ({}), retrying in {:?}",
                what,
                e,
                backoff
            );
            tokio::time::sleep(backoff).await;
            op().await
        }
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Portable equality query understood by every backend
///
/// The checkpoint ledger only ever needs "rows of a table where these
/// fields equal these values, optionally ordered and limited".
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub table: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Selector {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A read or delete request
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Selector),
    /// Parameterized statement, relational backends only
    Sql { statement: String, params: Vec<Value> },
    /// Raw query DSL body against one table, document backends only
    Search { table: String, body: Value },
}

impl From<Selector> for Query {
    fn from(selector: Selector) -> Self {
        Self::Select(selector)
    }
}

/// Lazy, forward-only stream of records from [`Store::read`]
pub struct RecordStream {
    rx: mpsc::Receiver<Result<Record>>,
}

impl RecordStream {
    /// A stream fed by the returned sender
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<Record>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        let (tx, stream) = Self::channel(records.len());
        for record in records {
            // Capacity covers every record, so this cannot fill up
            let _ = tx.try_send(Ok(record));
        }
        stream
    }

    pub async fn next(&mut self) -> Option<Result<Record>> {
        self.rx.recv().await
    }

    /// Drain the stream, stopping at the first error
    pub async fn try_collect(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }
}

/// Uniform operations over a relational or document store
///
/// Every call connects, operates and releases; there are no cross-call
/// transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// The canonical configuration this store was opened with
    fn config(&self) -> &StoreConfig;

    /// Create missing tables; with `force`, drop and recreate the named ones
    async fn configure(&self, tables: &[TableSchema], force: bool) -> Result<()>;

    /// Whether `table` exists, without creating the store
    async fn has_table(&self, table: &str) -> Result<bool>;

    /// Insert a batch of rows
    ///
    /// With `tolerate`, rows rejected by a constraint are returned instead of
    /// failing the batch.
    ///
    /// # Errors
    /// Without `tolerate`, the first violation fails the whole batch with
    /// [`StoreError::Constraint`] and nothing is written.
    async fn write(&self, rows: Vec<Row>, table: &TableSchema, tolerate: bool) -> Result<Vec<Row>>;

    /// Update rows matched on `key_fields`; null fields are left untouched
    ///
    /// Returns the number of stored rows changed.
    async fn update(&self, rows: Vec<Record>, table: &TableSchema, key_fields: &[&str])
    -> Result<usize>;

    async fn read(&self, query: Query) -> Result<RecordStream>;

    /// Delete matching rows, returning how many were removed
    async fn delete(&self, query: Query) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_selector_builder() {
        let selector = Selector::table("metadata")
            .eq("content_hash", "abc")
            .order_by("sequence_number", Order::Desc)
            .limit(1);

        assert_eq!(selector.filters, vec![("content_hash".into(), json!("abc"))]);
        assert_eq!(
            selector.order_by,
            Some(("sequence_number".into(), Order::Desc))
        );
        assert_eq!(selector.limit, Some(1));
    }

    #[test]
    fn test_error_classes_survive_context() {
        use eyre::WrapErr;

        let err: Result<()> = Err(StoreError::Unreachable("es:9200".into()).into());
        let err = err.wrap_err("reading metadata").unwrap_err();
        assert!(is_unreachable(&err));
        assert!(!is_constraint(&err));
    }

    #[tokio::test]
    async fn test_retry_once_when_unreachable() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = retry_unreachable(Duration::from_millis(1), "read", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Unreachable("down".into()).into())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = retry_unreachable(Duration::from_millis(1), "read", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unreachable("down".into()).into())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = retry_unreachable(Duration::from_millis(1), "read", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(eyre!("syntax error"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_stream_collects() {
        let mut record = Record::new();
        record.insert("id".into(), json!(1));
        let stream = RecordStream::from_records(vec![record.clone(), record]);
        assert_eq!(stream.try_collect().await.unwrap().len(), 2);
    }
}
