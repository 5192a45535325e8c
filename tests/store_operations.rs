use azsql_memory::db::schema::{self, Schema, SchemaPolicy, TableDef};
use azsql_memory::db::{
    EmbeddingData, Engine, MemoryStore, Predicate, PromptMemoryEntry, ScoreEntry, StoreOptions,
};
use azsql_memory::StoreError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn temp_database(pool_size: u32) -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("memory.db");
    let conn = format!("Database={};Max Pool Size={}", path.display(), pool_size);
    (dir, conn)
}

fn strict() -> StoreOptions {
    StoreOptions {
        schema_policy: SchemaPolicy::Strict,
        operation_timeout: None,
    }
}

async fn open_store(conn: &str) -> MemoryStore {
    let engine = Engine::create(conn, false).expect("engine");
    let store = MemoryStore::with_engine(engine, MemoryStore::default_schema(), strict());
    store.ensure_schema().await.expect("schema");
    store
}

fn orchestrator(id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("id".to_string(), id.to_string()),
        ("__type__".to_string(), "RedTeamingOrchestrator".to_string()),
    ])
}

#[tokio::test]
async fn ensure_schema_twice_leaves_the_same_tables() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let first = schema::table_names(store.engine()).await.unwrap();
    store.ensure_schema().await.unwrap();
    let second = schema::table_names(store.engine()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first,
        vec!["embeddings", "prompt_memory_entries", "score_entries"]
    );
    store.dispose().await;
}

#[tokio::test]
async fn ensure_schema_keeps_existing_rows() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;
    store
        .insert_one(&PromptMemoryEntry::new("user", "conv", 0, "hello"))
        .await
        .unwrap();

    store.ensure_schema().await.unwrap();
    assert_eq!(store.count::<PromptMemoryEntry>().await.unwrap(), 1);
}

#[tokio::test]
async fn reset_then_query_returns_nothing() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let piece = PromptMemoryEntry::new("user", "conv-1", 0, "hello");
    let score = ScoreEntry::new(&piece.id, ScoreEntry::TRUE_FALSE, "True");
    store.add_request_pieces(&[piece]).await.unwrap();
    store.add_scores(&[score]).await.unwrap();
    assert_eq!(store.get_all_prompt_pieces().await.unwrap().len(), 1);

    store.reset_database().await.unwrap();

    assert!(store.get_all_prompt_pieces().await.unwrap().is_empty());
    assert!(store.query::<ScoreEntry>(None).await.unwrap().is_empty());
    assert_eq!(
        schema::table_names(store.engine()).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn predicate_selects_exactly_the_matching_rows() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let pieces = vec![
        PromptMemoryEntry::new("user", "conv-a", 0, "first"),
        PromptMemoryEntry::new("assistant", "conv-b", 0, "second"),
        PromptMemoryEntry::new("user", "conv-c", 0, "third"),
    ];
    store.insert_many(&pieces).await.unwrap();

    let found = store
        .query::<PromptMemoryEntry>(Some(&Predicate::eq("conversation_id", "conv-b")))
        .await
        .unwrap();
    assert_eq!(found, vec![pieces[1].clone()]);

    let all = store.query::<PromptMemoryEntry>(None).await.unwrap();
    assert_eq!(all, pieces);
}

#[tokio::test]
async fn batch_with_one_malformed_entry_persists_nothing() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;
    store
        .insert_many(&[
            PromptMemoryEntry::new("user", "seed", 0, "a"),
            PromptMemoryEntry::new("assistant", "seed", 1, "b"),
        ])
        .await
        .unwrap();
    let before = store.count::<PromptMemoryEntry>().await.unwrap();

    let mut batch: Vec<_> = (0..5)
        .map(|i| PromptMemoryEntry::new("user", "batch", i, format!("valid {i}")))
        .collect();
    // Violates the role CHECK constraint.
    batch[3].role = "narrator".to_string();

    let err = store.insert_many(&batch).await.unwrap_err();
    assert!(
        matches!(err, StoreError::StorageWrite { table: "prompt_memory_entries", .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(store.count::<PromptMemoryEntry>().await.unwrap(), before);
    assert!(
        store
            .get_prompt_pieces_by_conversation("batch")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn duplicate_id_rolls_back_the_whole_batch() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let first = PromptMemoryEntry::new("user", "dup", 0, "a");
    let mut clash = PromptMemoryEntry::new("user", "dup", 2, "c");
    clash.id = first.id.clone();
    let batch = vec![first, PromptMemoryEntry::new("user", "dup", 1, "b"), clash];

    assert!(store.insert_many(&batch).await.is_err());
    assert_eq!(store.count::<PromptMemoryEntry>().await.unwrap(), 0);
}

#[tokio::test]
async fn insert_one_reports_write_failures() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let piece = PromptMemoryEntry::new("user", "conv", 0, "hello");
    store.insert_one(&piece).await.unwrap();
    let err = store.insert_one(&piece).await.unwrap_err();
    assert!(matches!(err, StoreError::StorageWrite { .. }));

    // Scores must reference an existing prompt piece.
    let orphan = ScoreEntry::new("missing-piece", ScoreEntry::FLOAT_SCALE, "0.5");
    assert!(matches!(
        store.insert_one(&orphan).await,
        Err(StoreError::StorageWrite { table: "score_entries", .. })
    ));
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;
    store.insert_many::<ScoreEntry>(&[]).await.unwrap();
    assert_eq!(store.count::<ScoreEntry>().await.unwrap(), 0);
}

#[tokio::test]
async fn pieces_by_orchestrator_skip_non_json_identifiers() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let wanted = PromptMemoryEntry::new("user", "c1", 0, "a").with_orchestrator(&orchestrator("orc-1"));
    let other = PromptMemoryEntry::new("user", "c2", 0, "b").with_orchestrator(&orchestrator("orc-2"));
    let mut garbage = PromptMemoryEntry::new("user", "c3", 0, "c");
    garbage.orchestrator_identifier = Some("not json at all".to_string());
    let missing = PromptMemoryEntry::new("user", "c4", 0, "d");

    store
        .add_request_pieces(&[wanted.clone(), other, garbage, missing])
        .await
        .unwrap();

    let found = store.get_prompt_pieces_by_orchestrator("orc-1").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, wanted.id);
    assert!(
        store
            .get_prompt_pieces_by_orchestrator("orc-9")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn lookups_by_id_sets_and_foreign_keys() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let pieces: Vec<_> = (0..4)
        .map(|i| {
            PromptMemoryEntry::new("assistant", "conv", i, format!("reply {i}"))
                .with_label("op_name", "unit")
        })
        .collect();
    store.add_request_pieces(&pieces).await.unwrap();

    let scores = vec![
        ScoreEntry::new(&pieces[0].id, ScoreEntry::TRUE_FALSE, "True")
            .with_rationale("refused")
            .with_scorer("__type__", "SelfAskRefusalScorer"),
        ScoreEntry::new(&pieces[2].id, ScoreEntry::FLOAT_SCALE, "0.25")
            .with_category("harm"),
        ScoreEntry::new(&pieces[3].id, ScoreEntry::TRUE_FALSE, "False"),
    ];
    store.add_scores(&scores).await.unwrap();

    let ids = vec![pieces[1].id.clone(), pieces[2].id.clone()];
    let by_id = store.get_prompt_pieces_by_ids(&ids).await.unwrap();
    assert_eq!(by_id, vec![pieces[1].clone(), pieces[2].clone()]);
    assert_eq!(by_id[0].labels.0.get("op_name").map(String::as_str), Some("unit"));

    let found = store
        .get_scores_by_prompt_ids(&[pieces[0].id.clone(), pieces[1].id.clone()])
        .await
        .unwrap();
    assert_eq!(found, vec![scores[0].clone()]);

    assert!(store.get_prompt_pieces_by_ids(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn embeddings_are_stored_with_their_vectors() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let piece = PromptMemoryEntry::new("user", "conv", 0, "embed me");
    store.add_request_pieces(std::slice::from_ref(&piece)).await.unwrap();
    let embedding = EmbeddingData::new(&piece.id, vec![0.5, -1.0, 0.25], "AzureTextEmbedding");
    store.add_embeddings(std::slice::from_ref(&embedding)).await.unwrap();

    assert_eq!(store.get_all_embeddings().await.unwrap(), vec![embedding]);
}

#[tokio::test]
async fn non_finite_embeddings_are_rejected_before_writing() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let pieces = vec![
        PromptMemoryEntry::new("user", "conv", 0, "kept"),
        PromptMemoryEntry::new("user", "conv", 1, "nan"),
        PromptMemoryEntry::new("user", "conv", 2, "inf"),
    ];
    store.add_request_pieces(&pieces).await.unwrap();
    let good = EmbeddingData::new(&pieces[0].id, vec![0.5, 0.25], "AzureTextEmbedding");
    store.add_embeddings(std::slice::from_ref(&good)).await.unwrap();

    let with_nan = EmbeddingData::new(&pieces[1].id, vec![0.5, f32::NAN], "AzureTextEmbedding");
    let err = store.insert_one(&with_nan).await.unwrap_err();
    assert!(
        matches!(err, StoreError::InvalidEntry { table: "embeddings", .. }),
        "unexpected error: {err:?}"
    );

    // One bad entry keeps the whole batch out.
    let batch = vec![
        EmbeddingData::new(&pieces[1].id, vec![1.0], "AzureTextEmbedding"),
        EmbeddingData::new(&pieces[2].id, vec![f32::INFINITY], "AzureTextEmbedding"),
    ];
    assert!(matches!(
        store.add_embeddings(&batch).await,
        Err(StoreError::InvalidEntry { .. })
    ));

    assert_eq!(store.get_all_embeddings().await.unwrap(), vec![good]);
}

#[tokio::test]
async fn unknown_predicate_column_is_rejected() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;

    let err = store
        .query::<ScoreEntry>(Some(&Predicate::eq("conversation_id", "x")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidPredicate(_)));
}

#[tokio::test]
async fn read_failures_are_errors_unless_degraded_explicitly() {
    let (_dir, conn) = temp_database(2);
    let engine = Engine::create(&conn, false).unwrap();
    let store = MemoryStore::with_engine(
        engine,
        Schema::new().with::<PromptMemoryEntry>(),
        strict(),
    );
    store.ensure_schema().await.unwrap();

    // The embeddings table was never declared, so it does not exist.
    let err = store.query::<EmbeddingData>(None).await.unwrap_err();
    assert!(matches!(err, StoreError::StorageRead { table: "embeddings", .. }));

    let rows = store.query_or_empty::<EmbeddingData>(None).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn schema_policy_decides_whether_failures_propagate() {
    let (_dir, conn) = temp_database(2);
    let broken = TableDef::new("broken", "CREATE TABLE broken (");
    let schema = Schema::new()
        .with_table(broken)
        .with::<PromptMemoryEntry>();

    let engine = Engine::create(&conn, false).unwrap();
    let err = schema::ensure_schema(&engine, &schema, SchemaPolicy::Strict)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Schema { table: "broken", .. }));
    assert!(schema::table_names(&engine).await.unwrap().is_empty());

    schema::ensure_schema(&engine, &schema, SchemaPolicy::BestEffort)
        .await
        .unwrap();
    assert_eq!(
        schema::table_names(&engine).await.unwrap(),
        vec!["prompt_memory_entries"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_succeed_or_fail_independently() {
    const WRITERS: i64 = 8;
    const BATCH: i64 = 5;
    const FAILING: i64 = 3;

    let (_dir, conn) = temp_database(4);
    let store = Arc::new(open_store(&conn).await);

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let n = store.count::<PromptMemoryEntry>().await.unwrap();
                // A reader only ever sees whole batches.
                assert_eq!(n % BATCH, 0, "observed a partial batch: {n}");
                tokio::task::yield_now().await;
            }
        })
    };

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let store = store.clone();
            tokio::spawn(async move {
                let conversation = format!("writer-{w}");
                let mut batch: Vec<_> = (0..BATCH)
                    .map(|i| PromptMemoryEntry::new("user", conversation.as_str(), i, "msg"))
                    .collect();
                if w == FAILING {
                    batch[4].id = batch[0].id.clone();
                }
                (w, store.insert_many(&batch).await)
            })
        })
        .collect();

    for handle in writers {
        let (w, result) = handle.await.unwrap();
        if w == FAILING {
            assert!(matches!(result, Err(StoreError::StorageWrite { .. })));
        } else {
            result.unwrap_or_else(|e| panic!("writer {w} failed: {e}"));
        }
    }
    reader.await.unwrap();

    assert_eq!(
        store.count::<PromptMemoryEntry>().await.unwrap(),
        (WRITERS - 1) * BATCH
    );
    assert!(
        store
            .get_prompt_pieces_by_conversation(&format!("writer-{FAILING}"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn operations_after_dispose_fail() {
    let (_dir, conn) = temp_database(2);
    let store = open_store(&conn).await;
    store
        .insert_one(&PromptMemoryEntry::new("user", "conv", 0, "hi"))
        .await
        .unwrap();

    store.dispose().await;
    store.dispose().await;
    assert!(store.engine().is_disposed());

    let piece = PromptMemoryEntry::new("user", "conv", 1, "again");
    assert!(matches!(
        store.insert_one(&piece).await,
        Err(StoreError::EngineDisposed)
    ));
    assert!(matches!(
        store.query::<PromptMemoryEntry>(None).await,
        Err(StoreError::EngineDisposed)
    ));
    assert!(matches!(
        store.query_or_empty::<PromptMemoryEntry>(None).await,
        Err(StoreError::EngineDisposed)
    ));
    assert!(matches!(
        store.ensure_schema().await,
        Err(StoreError::EngineDisposed)
    ));
}

#[tokio::test]
async fn operation_deadline_bounds_waiting_for_a_connection() {
    let (_dir, conn) = temp_database(1);
    let engine = Engine::create(&conn, false).unwrap();
    let store = MemoryStore::with_engine(
        engine,
        MemoryStore::default_schema(),
        StoreOptions {
            schema_policy: SchemaPolicy::Strict,
            operation_timeout: Some(Duration::from_millis(200)),
        },
    );
    store.ensure_schema().await.unwrap();

    let held = store.engine().pool().acquire().await.unwrap();
    let err = store.query::<PromptMemoryEntry>(None).await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout(_)));
    assert!(
        store
            .query_or_empty::<PromptMemoryEntry>(None)
            .await
            .unwrap()
            .is_empty()
    );

    drop(held);
    assert!(store.query::<PromptMemoryEntry>(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_connection_strings_are_rejected() {
    for bad in [
        "Server",
        "Server=db.example.net",
        "Database=",
        "Database=x.db;Max Pool Size=lots",
        "Driver={unterminated;Database=x.db",
    ] {
        assert!(
            matches!(Engine::create(bad, false), Err(StoreError::EngineCreation(_))),
            "{bad:?} should fail engine creation"
        );
    }
}

#[test]
fn engine_creation_outside_a_runtime_is_an_error() {
    assert!(matches!(
        Engine::create("Database=unused.db", false),
        Err(StoreError::EngineCreation(_))
    ));
}
