//! Embedding runs against an on-disk database.

use embedstore::config::{FailurePolicy, TableConfig};
use embedstore::driver::{DriverConfig, EmbeddingDriver};
use embedstore::llm::HashingEmbedder;
use embedstore::rag::{Rag, related};
use embedstore::search::refresh_neighbor_cache;
use embedstore::store::encode_vector;
use embedstore::{EmbedStoreError, SimilaritySearch, Store};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// A fresh database path under the system temp dir.
fn temp_db(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("embedstore-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("store.sqlite")
}

fn kural_table() -> TableConfig {
    TableConfig {
        name: "tirukkural".into(),
        id_column: "kno".into(),
        text_columns: vec![
            "efirstline".into(),
            "esecondline".into(),
            "explanation".into(),
        ],
        vector_column: "embeddings".into(),
        neighbors_column: Some("related_knos".into()),
    }
}

fn seed(store: &Store, count: i64) {
    for id in 1..=count {
        let first = format!("couplet {id} first line");
        let second = if id % 2 == 0 { "rain and virtue" } else { "learning and wealth" };
        store
            .insert_record(id, &[first.as_str(), second, "an explanation"])
            .unwrap();
    }
}

fn driver_config(chunk_size: usize, batch_size: usize) -> DriverConfig {
    DriverConfig {
        chunk_size,
        batch_size,
        max_retries: 0,
        retry_delay: Duration::ZERO,
        ..DriverConfig::default()
    }
}

#[test]
fn test_embed_persists_across_reopen() {
    let path = temp_db("persist");
    let embedder = HashingEmbedder::new(64).unwrap();
    {
        let store = Store::open(&path, kural_table()).unwrap();
        seed(&store, 250);

        let mut chunks = Vec::new();
        let summary = EmbeddingDriver::new(&store, &embedder, driver_config(100, 32))
            .unwrap()
            .with_observer(|report| chunks.push(report.attempted))
            .run()
            .unwrap();

        assert_eq!(summary.attempted, 250);
        assert_eq!(summary.embedded, 250);
        assert_eq!(summary.commits, 3);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.remaining, 0);
        assert_eq!(chunks, vec![100, 100, 50]);
    }

    let store = Store::open(&path, kural_table()).unwrap();
    let status = store.status().unwrap();
    assert_eq!(status.total, 250);
    assert_eq!(status.embedded, 250);
    assert_eq!(status.pending, 0);
    assert_eq!(status.dimension, Some(64));

    let v = store.vector(17).unwrap().unwrap();
    assert_eq!(v, embedder.embed_one(&store.fetch_by_ids(&[17]).unwrap()[0].embedding_input()));

    // A second run has nothing to do.
    let summary = EmbeddingDriver::new(&store, &embedder, DriverConfig::default())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.commits, 0);
}

#[test]
fn test_limited_runs_resume() {
    let path = temp_db("resume");
    let embedder = HashingEmbedder::new(32).unwrap();
    let store = Store::open(&path, kural_table()).unwrap();
    seed(&store, 40);

    let config = DriverConfig {
        limit: Some(15),
        ..driver_config(10, 4)
    };
    let first = EmbeddingDriver::new(&store, &embedder, config.clone())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(first.embedded, 15);
    assert_eq!(first.remaining, 25);

    let second = EmbeddingDriver::new(&store, &embedder, driver_config(10, 4))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(second.embedded, 25);
    assert_eq!(second.remaining, 0);
    assert_eq!(store.count_pending().unwrap(), 0);
}

#[test]
fn test_changed_dimension_is_rejected() {
    let path = temp_db("dimension");
    let store = Store::open(&path, kural_table()).unwrap();
    seed(&store, 10);
    EmbeddingDriver::new(&store, &HashingEmbedder::new(16).unwrap(), driver_config(4, 2))
        .unwrap()
        .run()
        .unwrap();

    store.insert_record(11, &["new", "couplet", ""]).unwrap();
    store.insert_record(12, &["another", "", ""]).unwrap();

    let wider = HashingEmbedder::new(32).unwrap();
    let summary = EmbeddingDriver::new(&store, &wider, driver_config(4, 2))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.embedded, 0);
    assert_eq!(summary.failed, vec![11, 12]);
    assert!(matches!(
        summary.into_result(),
        Err(EmbedStoreError::PartialBatchFailure { failed }) if failed == vec![11, 12]
    ));
    assert_eq!(store.dimension().unwrap(), Some(16));

    let abort = DriverConfig {
        on_failure: FailurePolicy::Abort,
        ..driver_config(4, 2)
    };
    let summary = EmbeddingDriver::new(&store, &wider, abort)
        .unwrap()
        .run()
        .unwrap();
    assert!(summary.aborted);
    assert_eq!(summary.remaining, 2);
}

#[test]
fn test_foreign_vectors_of_mixed_length() {
    let path = temp_db("foreign");
    let store = Store::open(&path, kural_table()).unwrap();
    seed(&store, 3);

    // Another tool wrote these, so no dimension is recorded.
    let conn = rusqlite::Connection::open(&path).unwrap();
    for (id, vector) in [(1_i64, vec![1.0_f32, 0.0, 0.0]), (2, vec![0.0, 1.0])] {
        conn.execute(
            "UPDATE tirukkural SET embeddings = ?1 WHERE kno = ?2",
            rusqlite::params![encode_vector(&vector), id],
        )
        .unwrap();
    }
    drop(conn);

    assert_eq!(store.dimension().unwrap(), Some(3));

    let search = SimilaritySearch::new(&store);
    assert!(matches!(
        search.top_n(&[1.0, 0.0, 0.0], 2, &HashSet::new()),
        Err(EmbedStoreError::DimensionMismatch { id: Some(2), expected: 3, actual: 2 })
    ));
    assert!(matches!(
        refresh_neighbor_cache(&store, 1),
        Err(EmbedStoreError::DimensionMismatch { id: Some(2), .. })
    ));

    let short = BTreeMap::from([(3, vec![1.0, 0.0])]);
    assert!(matches!(
        store.write_vectors(&short),
        Err(EmbedStoreError::DimensionMismatch { .. })
    ));
    assert!(store.vector(3).unwrap().is_none());

    let matching = BTreeMap::from([(3, vec![0.0, 0.0, 1.0])]);
    assert_eq!(store.write_vectors(&matching).unwrap(), 1);
}

#[test]
fn test_query_paths_after_embedding() {
    let path = temp_db("query");
    let embedder = HashingEmbedder::new(1024).unwrap();
    let store = Store::open(&path, kural_table()).unwrap();
    seed(&store, 20);
    EmbeddingDriver::new(&store, &embedder, driver_config(8, 3))
        .unwrap()
        .run()
        .unwrap();

    let hits = related(&store, 4, 5).unwrap();
    assert_eq!(hits.len(), 5);
    assert!(hits.iter().all(|h| h.id != 4));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

    let rag = Rag::new(&store, &embedder);
    let hits = rag.search("couplet 7 first line learning and wealth", 3).unwrap();
    assert_eq!(hits[0].id, 7);

    assert_eq!(refresh_neighbor_cache(&store, 3).unwrap(), 20);
    let cached = store.neighbors(4).unwrap().unwrap();
    let live: Vec<i64> = related(&store, 4, 3).unwrap().iter().map(|h| h.id).collect();
    assert_eq!(cached, live);
}

#[test]
fn test_unopenable_path_is_unavailable() {
    let dir = temp_db("unavailable");
    // A directory cannot be opened as a database file.
    let parent = dir.parent().unwrap().to_path_buf();
    assert!(matches!(
        Store::open(&parent, kural_table()),
        Err(EmbedStoreError::StoreUnavailable(_))
    ));
}
