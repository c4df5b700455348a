//! Integration test for the Elasticsearch store
//!
//! Prerequisites:
//! - Elasticsearch running on localhost:9200 without security, or
//! - CHUNKLOAD_ES_URL pointing at one, with CHUNKLOAD_ES_APIKEY if needed

use chunk_loader::checkpoint::{Ledger, LoadState};
use chunk_loader::etl::{
    ChunkedLoader, ColumnRef, FieldMapping, FieldSource, LoadOptions, LoadStatus, MappedRowMaker,
    MemoryRowSource, Query, RawRow, RowSource, Selector,
};
use chunk_loader::schema::{ColumnKind, FieldSpec, TableSchema};
use chunk_loader::store::{StoreSpec, open};
use eyre::Result;

fn store_spec(name: &str) -> Result<StoreSpec> {
    let host = std::env::var("CHUNKLOAD_ES_URL").unwrap_or_else(|_| "http://localhost:9200".into());
    let credential = match std::env::var("CHUNKLOAD_ES_APIKEY") {
        Ok(_) => "\ncredential:\n  type: apikey\n  apikey_env: CHUNKLOAD_ES_APIKEY",
        Err(_) => "",
    };
    let yaml = format!(
        "backend: elasticsearch\nname: {}\nhost: {}\nretry_backoff_secs: 1{}",
        name, host, credential
    );
    Ok(serde_yaml::from_str(&yaml)?)
}

#[tokio::test]
#[ignore] // Requires a live Elasticsearch
async fn test_resume_on_elasticsearch() -> Result<()> {
    let name = format!("chunkload-it-{}", chrono::Utc::now().timestamp_millis());
    let config = store_spec(&name)?.normalise()?;

    let table = TableSchema::new(
        "letters",
        vec![
            FieldSpec::key("id", ColumnKind::Integer),
            FieldSpec::new("letter", ColumnKind::Text),
            FieldSpec::new("number", ColumnKind::Real),
        ],
    );
    let mut mapping = FieldMapping::new();
    for (i, field) in ["id", "letter", "number"].into_iter().enumerate() {
        mapping.insert(field.into(), Some(FieldSource::Column(ColumnRef::Index(i))));
    }
    let source = MemoryRowSource::new(
        "letters",
        vec![
            RawRow::positional(["1", "A", "1"]),
            RawRow::positional(["2", "B", "2"]),
            RawRow::positional(["3", "B", "2"]),
        ],
    );

    let first = ChunkedLoader::new(
        config.clone(),
        LoadOptions {
            chunk_size: Some(1),
            chaos_monkey: true,
            ..Default::default()
        },
    )
    .run(&table, &mapping, &source, &MappedRowMaker)
    .await?;
    assert_eq!(first.status, LoadStatus::ChaosMonkey);

    let second = ChunkedLoader::new(
        config.clone(),
        LoadOptions {
            chunk_size: Some(1),
            ..Default::default()
        },
    )
    .run(&table, &mapping, &source, &MappedRowMaker)
    .await?;
    assert_eq!(second.status, LoadStatus::Completed);

    let store = open(config)?;
    let letters = store
        .read(Selector::table("letters").into())
        .await?
        .try_collect()
        .await?;
    assert_eq!(letters.len(), 3);

    let ledger = Ledger::new(store.clone());
    let metadata = ledger
        .find(&source.content_hash()?)
        .await?
        .expect("metadata recorded");
    assert_eq!(metadata.chunk_count, 3);
    assert_eq!(metadata.status, LoadState::Complete);

    for table in ["letters", "metadata", "session_log"] {
        store
            .delete(Query::Search {
                table: table.into(),
                body: serde_json::json!({ "query": { "match_all": {} } }),
            })
            .await?;
    }
    Ok(())
}
