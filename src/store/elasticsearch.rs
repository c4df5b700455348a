//! Elasticsearch store adapter
//!
//! Each table is one index named `{store}-{table}`. Writes use `_bulk`
//! `create` actions keyed on the primary key, so a duplicate key comes back
//! as a per-item conflict rather than silently overwriting a document.

use super::StoreConfig;
use crate::client::{Auth, ElasticsearchClient, is_not_found, json_body};
use crate::etl::{Order, Query, RecordStream, Selector, Store, StoreError};
use crate::schema::{Record, Row, TableSchema};
use async_trait::async_trait;
use eyre::{Result, bail, eyre};
use serde_json::{Map, Value, json};

/// Documents fetched per `_search` page
const PAGE_SIZE: usize = 1000;

pub struct ElasticsearchStore {
    config: StoreConfig,
    client: ElasticsearchClient,
}

impl ElasticsearchStore {
    /// Build the store and its client from a canonical config
    pub fn try_new(config: StoreConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| eyre!("Elasticsearch store '{}' has no host", config.name))?;
        let auth = Auth::from_credential(config.credential.as_ref())?;
        let client = ElasticsearchClient::try_new(host, auth)?.with_retry_backoff(config.retry_backoff);
        Ok(Self { config, client })
    }

    /// Index backing `table`
    pub fn index(&self, table: &str) -> String {
        format!("{}-{}", self.config.name, table).to_lowercase()
    }
}

fn mappings(schema: &TableSchema) -> Value {
    let properties: Map<String, Value> = schema
        .fields
        .iter()
        .map(|f| (f.name.clone(), json!({ "type": f.kind.mapping_type() })))
        .collect();
    json!({ "mappings": { "properties": properties } })
}

fn filter_query(filters: &[(String, Value)]) -> Value {
    if filters.is_empty() {
        return json!({ "match_all": {} });
    }
    let terms: Vec<Value> = filters
        .iter()
        .map(|(field, value)| json!({ "term": { field: value } }))
        .collect();
    json!({ "bool": { "filter": terms } })
}

fn document_id(record: &Record, schema: &TableSchema) -> Option<String> {
    let keys = schema.key_fields();
    if keys.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        match record.get(key) {
            None | Some(Value::Null) => return None,
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(other) => parts.push(other.to_string()),
        }
    }
    Some(parts.join("|"))
}

/// Null fields are dropped so the document carries only known values
fn document(record: &Record) -> Value {
    Value::Object(
        record
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

impl ElasticsearchStore {
    async fn search_page(&self, index: &str, body: &Value) -> Result<Vec<Value>> {
        let response = self
            .client
            .post_json_value(&format!("/{}/_search", index), body)
            .await?;
        if is_not_found(&response) {
            return Err(StoreError::MissingStore(index.to_string()).into());
        }
        let body = json_body(response, &format!("search {}", index)).await?;
        Ok(body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Fetch every hit of a query with `search_after` paging
    async fn search_all(&self, index: &str, query: Value, sort: Vec<Value>, limit: Option<usize>) -> Result<Vec<Value>> {
        let mut hits = Vec::new();
        let mut search_after: Option<Value> = None;
        loop {
            let wanted = limit.map(|l| l.saturating_sub(hits.len())).unwrap_or(PAGE_SIZE);
            let size = wanted.min(PAGE_SIZE);
            if size == 0 {
                break;
            }
            let mut body = json!({ "query": query, "sort": sort, "size": size });
            if let Some(after) = &search_after {
                body["search_after"] = after.clone();
            }
            let page = self.search_page(index, &body).await?;
            let done = page.len() < size;
            search_after = page.last().and_then(|h| h.get("sort")).cloned();
            hits.extend(page);
            if done || search_after.is_none() {
                break;
            }
        }
        Ok(hits)
    }

    fn selector_search(&self, selector: &Selector) -> (String, Value, Vec<Value>) {
        let mut sort = Vec::new();
        if let Some((field, order)) = &selector.order_by {
            let order = match order {
                Order::Asc => "asc",
                Order::Desc => "desc",
            };
            sort.push(json!({ field: { "order": order } }));
        }
        // Tiebreaker so search_after pages are stable
        sort.push(json!({ "_doc": { "order": "asc" } }));
        (self.index(&selector.table), filter_query(&selector.filters), sort)
    }
}

fn source(hit: &Value) -> Record {
    hit.get("_source")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl Store for ElasticsearchStore {
    fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn configure(&self, tables: &[TableSchema], force: bool) -> Result<()> {
        for table in tables {
            let index = self.index(&table.name);
            if force {
                log::info!("Deleting index '{}'", index);
                let response = self.client.delete(&format!("/{}", index)).await?;
                if !is_not_found(&response) {
                    json_body(response, &format!("delete index {}", index)).await?;
                }
            }
            if !is_not_found(&self.client.head(&format!("/{}", index)).await?) {
                continue;
            }
            log::info!("Creating index '{}'", index);
            let response = self
                .client
                .put_json_value(&format!("/{}", index), &mappings(table))
                .await?;
            json_body(response, &format!("create index {}", index)).await?;
        }
        Ok(())
    }

    async fn has_table(&self, table: &str) -> Result<bool> {
        let response = self.client.head(&format!("/{}", self.index(table))).await?;
        if is_not_found(&response) {
            return Ok(false);
        }
        if !response.status().is_success() {
            bail!("Failed to check index {}: {}", self.index(table), response.status());
        }
        Ok(true)
    }

    /// Bulk-create documents
    ///
    /// Documents are not transactional: without `tolerate`, rows that were
    /// accepted before a conflict stay written and the call still fails.
    async fn write(&self, rows: Vec<Row>, table: &TableSchema, tolerate: bool) -> Result<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.index(&table.name);
        let mut body = String::new();
        for row in &rows {
            let record = row.clone().into_record(table)?;
            let action = match document_id(&record, table) {
                Some(id) => json!({ "create": { "_index": index, "_id": id } }),
                None => json!({ "create": { "_index": index } }),
            };
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&document(&record).to_string());
            body.push('\n');
        }

        let response = self
            .client
            .post_ndjson("/_bulk?refresh=wait_for", &body)
            .await?;
        let result = json_body(response, &format!("bulk write to {}", index)).await?;
        if !result["errors"].as_bool().unwrap_or(false) {
            return Ok(Vec::new());
        }

        let items = result["items"].as_array().cloned().unwrap_or_default();
        let mut rejected = Vec::new();
        for (row, item) in rows.into_iter().zip(items) {
            let Some(error) = item.pointer("/create/error") else {
                continue;
            };
            let kind = error["type"].as_str().unwrap_or_default();
            if kind != "version_conflict_engine_exception" {
                bail!(StoreError::Backend(format!("Bulk write to {} failed: {}", index, error)));
            }
            if !tolerate {
                bail!(StoreError::Constraint {
                    table: table.name.clone(),
                    detail: error["reason"].as_str().unwrap_or(kind).to_string(),
                });
            }
            rejected.push(row);
        }
        Ok(rejected)
    }

    async fn update(
        &self,
        rows: Vec<Record>,
        table: &TableSchema,
        key_fields: &[&str],
    ) -> Result<usize> {
        let index = self.index(&table.name);
        let mut changed = 0;
        for record in rows {
            let mut filters = Vec::with_capacity(key_fields.len());
            for key in key_fields {
                match record.get(*key) {
                    Some(value) if !value.is_null() => filters.push((key.to_string(), value.clone())),
                    _ => bail!("Update of '{}' is missing key field '{}'", table.name, key),
                }
            }
            let doc: Map<String, Value> = record
                .into_iter()
                .filter(|(field, value)| !value.is_null() && !key_fields.contains(&field.as_str()))
                .collect();
            if doc.is_empty() {
                continue;
            }

            let sort = vec![json!({ "_doc": { "order": "asc" } })];
            let hits = self.search_all(&index, filter_query(&filters), sort, None).await?;
            for hit in hits {
                let Some(id) = hit["_id"].as_str() else {
                    continue;
                };
                let response = self
                    .client
                    .post_json_value(
                        &format!("/{}/_update/{}?refresh=wait_for", index, id),
                        &json!({ "doc": doc }),
                    )
                    .await?;
                json_body(response, &format!("update {} in {}", id, index)).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn read(&self, query: Query) -> Result<RecordStream> {
        let hits = match query {
            Query::Select(selector) => {
                let (index, query, sort) = self.selector_search(&selector);
                self.search_all(&index, query, sort, selector.limit).await?
            }
            Query::Search { table, body } => {
                let index = self.index(&table);
                self.search_page(&index, &body).await?
            }
            Query::Sql { .. } => {
                return Err(StoreError::UnsupportedQuery {
                    backend: "elasticsearch",
                    detail: "SQL statements need a relational store".into(),
                }
                .into());
            }
        };
        Ok(RecordStream::from_records(hits.iter().map(source).collect()))
    }

    async fn delete(&self, query: Query) -> Result<u64> {
        let (index, body) = match query {
            Query::Select(selector) => (
                self.index(&selector.table),
                json!({ "query": filter_query(&selector.filters) }),
            ),
            Query::Search { table, body } => (self.index(&table), body),
            Query::Sql { .. } => {
                return Err(StoreError::UnsupportedQuery {
                    backend: "elasticsearch",
                    detail: "SQL statements need a relational store".into(),
                }
                .into());
            }
        };
        let response = self
            .client
            .post_json_value(&format!("/{}/_delete_by_query?refresh=true", index), &body)
            .await?;
        if is_not_found(&response) {
            return Err(StoreError::MissingStore(index).into());
        }
        let result = json_body(response, &format!("delete from {}", index)).await?;
        Ok(result["deleted"].as_u64().unwrap_or(0))
    }
}
