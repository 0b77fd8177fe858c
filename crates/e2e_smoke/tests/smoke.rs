//! Live-Postgres smoke tests for the full contribution/read pipeline. Each
//! test migrates into its own throwaway schema and drops it afterwards.
//! Skipped unless `TRIBUTARY_TEST_DB_URL` (or `DATABASE_URL`) is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use tributary_catalog::{CatalogStore, Page, QueryParams};
use tributary_contracts::{Action, RecordSubmission, SessionMode};
use tributary_identity::IdentityScheme;
use tributary_policy::{FieldMask, PolicyCache, PolicyProvider, PolicyScope};
use tributary_query as query;
use tributary_session::{AcceptAllValidator, SessionManager};

const SMOKE_SECRET: &[u8] = b"tributary-smoke-secret-0123456789";

fn test_db_url() -> Option<String> {
    std::env::var("TRIBUTARY_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

struct Harness {
    admin: PgPool,
    schema: String,
    store: CatalogStore,
    identity: IdentityScheme,
    sessions: SessionManager,
}

async fn harness(db_url: &str) -> Harness {
    let schema = format!("trib_test_{}", ulid::Ulid::new()).to_lowercase();

    let admin = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await
        .expect("DB connect should succeed");

    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin)
        .await
        .expect("create schema should succeed");

    let store = CatalogStore::connect_and_migrate(
        &schema_db_url(db_url, &schema),
        Duration::from_millis(2000),
    )
    .await
    .expect("catalog store should initialize");

    let identity = IdentityScheme::new(SMOKE_SECRET);
    let sessions = SessionManager::new(
        store.clone(),
        identity.clone(),
        Arc::new(AcceptAllValidator),
    );

    Harness {
        admin,
        schema,
        store,
        identity,
        sessions,
    }
}

impl Harness {
    async fn seed_connector(&self, slug: &str, live: bool) -> String {
        self.store
            .register_entity(
                "country",
                &serde_json::json!({"type": "object"}),
                &serde_json::json!({"population": {"unit": "persons", "cadence": "yearly"}}),
            )
            .await
            .expect("entity registration should succeed");

        let connector_id = self.identity.contribution_id("country", slug);
        self.store
            .register_connector(&connector_id, slug, "country", live)
            .await
            .expect("connector registration should succeed");
        connector_id
    }

    async fn log_size(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM trib_operation_log")
            .fetch_one(self.store.pool())
            .await
            .expect("log count should succeed")
    }

    async fn finish(self) {
        self.store.close().await;
        let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await;
        self.admin.close().await;
    }
}

fn submission(id: &str, name: &str, population: i64) -> RecordSubmission {
    RecordSubmission {
        id: id.to_string(),
        name: Some(name.to_string()),
        entity: serde_json::json!({"population": population}),
        instance: serde_json::json!({"source": "wiki"}),
    }
}

fn predicate(filter: &str) -> String {
    let translation = query::translate(filter);
    assert!(
        translation.valid,
        "filter should translate: {:?}",
        translation.error
    );
    translation.sql
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_session_is_visible_immediately_and_queryable() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Stream)
        .await
        .expect("open should succeed");

    let ack = h
        .sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[submission("GB", "United Kingdom", 67_000_000)],
        )
        .await
        .expect("stream upsert should succeed");
    let public_id = ack.get("GB").expect("GB should be acknowledged").clone();

    // Stream entries apply per call, before close.
    let sql = predicate(r#"{"entity.population":{"$gte":50000000}}"#);
    let records = h
        .store
        .query(QueryParams::new(&sql))
        .await
        .expect("query should succeed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].public_id, public_id);
    assert_eq!(records[0].document["name"], serde_json::json!("United Kingdom"));
    assert_eq!(
        records[0].document["timeseries"]["population"]["unit"],
        serde_json::json!("persons")
    );

    // The log drains as it applies.
    assert_eq!(h.log_size().await, 0);

    let replayed = h
        .sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");
    assert_eq!(replayed, 0, "stream close has nothing left to replay");

    let sql = predicate(r#"{"entity.population":{"$gte":100000000}}"#);
    assert!(h
        .store
        .query(QueryParams::new(&sql))
        .await
        .expect("query should succeed")
        .is_empty());

    let types = h
        .store
        .types(query::ALWAYS_TRUE, &[])
        .await
        .expect("types should succeed");
    assert_eq!(types, vec!["country".to_string()]);

    let found = h
        .store
        .find(query::ALWAYS_TRUE, &[], &public_id)
        .await
        .expect("find should succeed");
    assert!(found.is_some());

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_live_connector_requires_context_override() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Stream)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[submission("GB", "United Kingdom", 67_000_000)],
        )
        .await
        .expect("upsert should succeed");
    h.sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");

    h.store
        .set_live(&wikipedia, false)
        .await
        .expect("set_live should succeed");

    assert!(h
        .store
        .query(QueryParams::new(query::ALWAYS_TRUE))
        .await
        .expect("query should succeed")
        .is_empty());

    let context = vec![wikipedia.clone()];
    let records = h
        .store
        .query(QueryParams {
            segment_sql: query::ALWAYS_TRUE,
            connector_context: &context,
            type_filter: None,
            id_filter: None,
            page: Page::default(),
        })
        .await
        .expect("query should succeed");
    assert_eq!(records.len(), 1, "override restores visibility");

    // Entries beyond the context cap are truncated, not rejected: the real
    // connector id sits past the cap, so the query quietly misses it.
    let mut oversized: Vec<String> = (0..40).map(|i| format!("ghost-{i}")).collect();
    oversized.push(wikipedia.clone());
    let records = h
        .store
        .query(QueryParams {
            segment_sql: query::ALWAYS_TRUE,
            connector_context: &oversized,
            type_filter: None,
            id_filter: None,
            page: Page::default(),
        })
        .await
        .expect("query should succeed");
    assert!(records.is_empty());

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accrue_buffers_until_commit_and_discard_rolls_back() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Accrue)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[submission("FR", "France", 68_000_000)],
        )
        .await
        .expect("upsert should succeed");

    assert!(
        h.store
            .query(QueryParams::new(query::ALWAYS_TRUE))
            .await
            .expect("query should succeed")
            .is_empty(),
        "accrue buffers until close"
    );
    assert_eq!(h.log_size().await, 1);

    let replayed = h
        .sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");
    assert_eq!(replayed, 1);
    assert_eq!(h.log_size().await, 0);
    assert_eq!(
        h.store
            .query(QueryParams::new(query::ALWAYS_TRUE))
            .await
            .expect("query should succeed")
            .len(),
        1
    );

    // A discarded session leaves the catalog untouched.
    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Accrue)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Delete,
            &[submission("FR", "France", 0)],
        )
        .await
        .expect("delete should succeed");
    let replayed = h
        .sessions
        .close(&wikipedia, &session, false)
        .await
        .expect("discard should succeed");
    assert_eq!(replayed, 0);
    assert_eq!(
        h.store
            .query(QueryParams::new(query::ALWAYS_TRUE))
            .await
            .expect("query should succeed")
            .len(),
        1,
        "rollback must not apply the buffered delete"
    );

    // Deletes are idempotent: unknown vendor ids are no-ops.
    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Stream)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Delete,
            &[
                submission("FR", "France", 0),
                submission("XX", "Nowhere", 0),
            ],
        )
        .await
        .expect("idempotent delete should succeed");
    h.sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");
    assert!(h
        .store
        .query(QueryParams::new(query::ALWAYS_TRUE))
        .await
        .expect("query should succeed")
        .is_empty());

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replace_commit_swaps_the_connector_catalog() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Stream)
        .await
        .expect("open should succeed");
    let ack = h
        .sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[
                submission("GB", "United Kingdom", 67_000_000),
                submission("FR", "France", 68_000_000),
            ],
        )
        .await
        .expect("seed upsert should succeed");
    let gb_public_id = ack.get("GB").expect("GB acknowledged").clone();
    h.sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Replace)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[
                submission("GB", "United Kingdom", 68_500_000),
                submission("DE", "Germany", 84_000_000),
            ],
        )
        .await
        .expect("replace upsert should succeed");

    // Buffered; the old catalog is still intact mid-session.
    assert_eq!(
        h.store
            .query(QueryParams::new(query::ALWAYS_TRUE))
            .await
            .expect("query should succeed")
            .len(),
        2
    );

    let replayed = h
        .sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");
    assert_eq!(replayed, 2);

    let records = h
        .store
        .query(QueryParams::new(query::ALWAYS_TRUE))
        .await
        .expect("query should succeed");
    let mut names: Vec<&str> = records
        .iter()
        .filter_map(|r| r.document["name"].as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Germany", "United Kingdom"]);

    let gb = records
        .iter()
        .find(|r| r.vendor_id == "GB")
        .expect("GB should survive the swap");
    assert_eq!(
        gb.public_id, gb_public_id,
        "public id is stable across replace"
    );
    assert_eq!(
        gb.document["entity"]["population"],
        serde_json::json!(68_500_000_i64)
    );

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replace_swap_never_exposes_an_empty_connector() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Stream)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[
                submission("GB", "United Kingdom", 67_000_000),
                submission("FR", "France", 68_000_000),
                submission("DE", "Germany", 84_000_000),
            ],
        )
        .await
        .expect("seed upsert should succeed");
    h.sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Replace)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[
                submission("ES", "Spain", 48_000_000),
                submission("IT", "Italy", 59_000_000),
            ],
        )
        .await
        .expect("replace upsert should succeed");

    // Hammer the read side while the swap commits. The wipe and the replay
    // share one transaction, so a reader sees the old generation (3) or the
    // new one (2), never a vanished connector.
    let stop = Arc::new(AtomicBool::new(false));
    let reader_store = h.store.clone();
    let reader_stop = stop.clone();
    let reader = tokio::spawn(async move {
        let mut min_seen = usize::MAX;
        while !reader_stop.load(Ordering::Relaxed) {
            let records = reader_store
                .query(QueryParams::new(query::ALWAYS_TRUE))
                .await
                .expect("concurrent query should succeed");
            min_seen = min_seen.min(records.len());
            tokio::task::yield_now().await;
        }
        min_seen
    });

    let replayed = h
        .sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");
    assert_eq!(replayed, 2);

    stop.store(true, Ordering::Relaxed);
    let min_seen = reader.await.expect("reader task should finish");
    assert!(
        min_seen >= 2,
        "reader observed {} records mid-swap",
        min_seen
    );

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_actions_replay_in_sequence_order() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Accrue)
        .await
        .expect("open should succeed");

    // Parallel writers all target the same vendor id. The advisory lock
    // serializes the appends; whatever interleaving the scheduler picks,
    // replay must land the entry with the highest sequence last.
    let mut writers = Vec::new();
    for population in [61_000_000_i64, 62_000_000, 63_000_000, 64_000_000] {
        let sessions = h.sessions.clone();
        let connector = wikipedia.clone();
        let session = session.clone();
        writers.push(tokio::spawn(async move {
            sessions
                .action(
                    &connector,
                    &session,
                    Action::Upsert,
                    &[submission("GB", "United Kingdom", population)],
                )
                .await
        }));
    }
    for writer in writers {
        writer
            .await
            .expect("writer task should finish")
            .expect("concurrent action should succeed");
    }
    assert_eq!(h.log_size().await, 4);

    let last_payload: serde_json::Value = sqlx::query_scalar(
        "SELECT payload_json FROM trib_operation_log ORDER BY sequence DESC LIMIT 1",
    )
    .fetch_one(h.store.pool())
    .await
    .expect("log read should succeed");
    let expected = last_payload["entity"]["population"].clone();

    let replayed = h
        .sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");
    assert_eq!(replayed, 4);

    let records = h
        .store
        .query(QueryParams::new(query::ALWAYS_TRUE))
        .await
        .expect("query should succeed");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].document["entity"]["population"], expected,
        "the highest-sequence write wins"
    );

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopening_discards_the_previous_session() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let first = h
        .sessions
        .open(&wikipedia, SessionMode::Accrue)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &first,
            Action::Upsert,
            &[submission("GB", "United Kingdom", 67_000_000)],
        )
        .await
        .expect("upsert should succeed");

    let second = h
        .sessions
        .open(&wikipedia, SessionMode::Accrue)
        .await
        .expect("reopen should succeed");
    assert_ne!(first, second);
    assert_eq!(h.log_size().await, 0, "reopen discards the prior buffer");

    let err = h
        .sessions
        .action(
            &wikipedia,
            &first,
            Action::Upsert,
            &[submission("FR", "France", 68_000_000)],
        )
        .await
        .expect_err("stale handle must be rejected");
    assert_eq!(err.code(), "ERR_UNAUTHORIZED");

    let err = h
        .sessions
        .close(&wikipedia, &first, true)
        .await
        .expect_err("stale close must be rejected");
    assert_eq!(err.code(), "ERR_UNAUTHORIZED");

    h.sessions
        .action(
            &wikipedia,
            &second,
            Action::Upsert,
            &[submission("FR", "France", 68_000_000)],
        )
        .await
        .expect("upsert should succeed");
    let replayed = h
        .sessions
        .close(&wikipedia, &second, true)
        .await
        .expect("close should succeed");
    assert_eq!(replayed, 1);

    let records = h
        .store
        .query(QueryParams::new(query::ALWAYS_TRUE))
        .await
        .expect("query should succeed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].vendor_id, "FR", "GB was never applied");

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn policy_scope_segments_masks_and_resolves() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping smoke test; set TRIBUTARY_TEST_DB_URL to enable");
        return;
    };
    let h = harness(&db_url).await;
    let wikipedia = h.seed_connector("wikipedia", true).await;

    let session = h
        .sessions
        .open(&wikipedia, SessionMode::Stream)
        .await
        .expect("open should succeed");
    h.sessions
        .action(
            &wikipedia,
            &session,
            Action::Upsert,
            &[
                submission("GB", "United Kingdom", 67_000_000),
                submission("LI", "Liechtenstein", 39_000),
            ],
        )
        .await
        .expect("upsert should succeed");
    h.sessions
        .close(&wikipedia, &session, true)
        .await
        .expect("close should succeed");

    let provider = PolicyProvider::new(
        h.store.pool().clone(),
        PolicyCache::new(8, Duration::from_secs(60)),
    );

    assert!(provider
        .resolve("missing")
        .await
        .expect("resolve should succeed")
        .is_none());

    provider
        .upsert_policy(
            "analysts",
            &PolicyScope {
                segment_query: Some(serde_json::json!({"entity.population": {"$gte": 1000000}})),
                field_masks: vec!["instance".to_string()],
                connector_override: Vec::new(),
            },
        )
        .await
        .expect("policy upsert should succeed");

    let scope = provider
        .resolve("analysts")
        .await
        .expect("resolve should succeed")
        .expect("policy should exist");

    let segment = query::translate_value(scope.segment_query.as_ref().unwrap());
    assert!(segment.valid);

    // Client filter matches Liechtenstein; the policy segment excludes it.
    let client = predicate(r#"{"name":{"$regex":"^Lie","$options":""}}"#);
    assert_eq!(
        h.store
            .query(QueryParams::new(&client))
            .await
            .expect("query should succeed")
            .len(),
        1
    );
    let conjoined = query::conjoin(&client, &segment.sql);
    assert!(h
        .store
        .query(QueryParams::new(&conjoined))
        .await
        .expect("query should succeed")
        .is_empty());

    // Masked fields never leave the read side.
    let mut records = h
        .store
        .query(QueryParams::new(&segment.sql))
        .await
        .expect("query should succeed");
    assert_eq!(records.len(), 1);
    let mask = FieldMask::new(&scope.field_masks);
    mask.apply(&mut records[0].document);
    assert!(records[0].document.get("instance").is_none());
    assert!(records[0].document.get("name").is_some());

    h.finish().await;
}
