//! Postgres event store and outbox integration tests.
//!
//! Run with: cargo test -p eventide-infra --test postgres_stores -- --ignored
//!
//! Requires: DATABASE_URL pointing at a Postgres instance. Every test works in
//! its own schema, so runs do not see each other's rows.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use eventide_core::{EventId, StreamId, TenantId};
use eventide_events::DomainEvent;
use eventide_infra::event_store::{EventStore, EventStoreError, PostgresEventStore, TimestampPosition};
use eventide_infra::outbox::{
    ClaimRequest, OutboxError, OutboxRecord, OutboxStatus, OutboxStore, PostgresOutboxStore,
};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a Postgres instance")
}

struct TestDb {
    pool: PgPool,
    schema: String,
}

impl TestDb {
    /// Fresh schema with the event store and outbox tables.
    async fn new() -> Self {
        let url = database_url();
        let schema = format!("eventide_test_{}", Uuid::now_v7().simple());

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("Failed to connect to Postgres");
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .expect("Failed to create test schema");
        admin.close().await;

        let search_path = schema.clone();
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .after_connect(move |conn, _meta| {
                let sql = format!("SET search_path TO {search_path}");
                Box::pin(async move {
                    sqlx::query(&sql).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .expect("Failed to connect to Postgres");

        PostgresEventStore::new(pool.clone())
            .ensure_schema()
            .await
            .expect("Failed to create tables");

        Self { pool, schema }
    }

    async fn cleanup(self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.pool)
            .await
            .expect("Failed to drop test schema");
        self.pool.close().await;
    }
}

fn deposits(stream: &str, tenant: TenantId, versions: std::ops::RangeInclusive<u64>) -> Vec<DomainEvent> {
    versions
        .map(|v| DomainEvent::new(StreamId::new(stream), tenant, v, "Deposited", json!({"amount": v})))
        .collect()
}

fn claim(batch_size: usize) -> ClaimRequest {
    ClaimRequest {
        batch_size,
        now: Utc::now(),
        claim_timeout: Duration::from_secs(60),
    }
}

#[tokio::test]
#[ignore = "requires running Postgres instance"]
async fn concurrent_claimers_never_share_a_record() {
    let db = TestDb::new().await;
    let first = PostgresOutboxStore::new(db.pool.clone());
    let second = PostgresOutboxStore::new(db.pool.clone());

    let tenant = TenantId::new();
    let records: Vec<OutboxRecord> = deposits("acc-1", tenant, 1..=20)
        .iter()
        .map(OutboxRecord::from_event)
        .collect();
    first.enqueue(records).await.unwrap();

    let (a, b) = tokio::join!(first.claim_batch(claim(15)), second.claim_batch(claim(15)));
    let (a, b) = (a.unwrap(), b.unwrap());

    let a_ids: HashSet<EventId> = a.iter().map(|r| r.id).collect();
    let b_ids: HashSet<EventId> = b.iter().map(|r| r.id).collect();
    assert!(a_ids.is_disjoint(&b_ids));
    assert_eq!(a_ids.len() + b_ids.len(), 20);
    assert!(a.iter().chain(&b).all(|r| r.status == OutboxStatus::Processing));

    // Everything is claimed and not yet stale.
    assert!(first.claim_batch(claim(15)).await.unwrap().is_empty());
    assert_eq!(first.stats().await.unwrap().processing, 20);

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires running Postgres instance"]
async fn transitions_only_apply_to_processing_records() {
    let db = TestDb::new().await;
    let outbox = PostgresOutboxStore::new(db.pool.clone());

    let tenant = TenantId::new();
    let records: Vec<OutboxRecord> = deposits("acc-1", tenant, 1..=3)
        .iter()
        .map(OutboxRecord::from_event)
        .collect();
    let ids: Vec<EventId> = records.iter().map(|r| r.id).collect();
    outbox.enqueue(records).await.unwrap();

    // Pending records cannot be completed before they are claimed.
    assert!(matches!(
        outbox.mark_done(ids[0], Utc::now()).await,
        Err(OutboxError::InvalidTransition {
            from: OutboxStatus::Pending,
            to: OutboxStatus::Done,
            ..
        })
    ));
    assert!(matches!(
        outbox.mark_done(EventId::new(), Utc::now()).await,
        Err(OutboxError::NotFound(_))
    ));

    assert_eq!(outbox.claim_batch(claim(10)).await.unwrap().len(), 3);

    outbox.mark_done(ids[0], Utc::now()).await.unwrap();
    assert!(matches!(
        outbox.mark_done(ids[0], Utc::now()).await,
        Err(OutboxError::InvalidTransition {
            from: OutboxStatus::Done,
            ..
        })
    ));

    outbox.mark_dlq(ids[2], 5, "poison").await.unwrap();
    assert_eq!(outbox.list_dlq(10).await.unwrap().len(), 1);

    // Backoff hides the retried record until next_attempt_at.
    let later = Utc::now() + chrono::Duration::minutes(5);
    outbox.mark_retry(ids[1], 1, "broker down", later).await.unwrap();
    assert!(outbox.claim_batch(claim(10)).await.unwrap().is_empty());
    let due = ClaimRequest {
        now: later + chrono::Duration::seconds(1),
        ..claim(10)
    };
    let reclaimed = outbox.claim_batch(due).await.unwrap();
    assert_eq!(reclaimed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[1]]);
    assert_eq!(reclaimed[0].retry_count, 1);

    outbox.requeue_dlq(ids[2]).await.unwrap();
    let requeued = outbox.get(ids[2]).await.unwrap().unwrap();
    assert_eq!((requeued.status, requeued.retry_count), (OutboxStatus::Pending, 0));

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires running Postgres instance"]
async fn conflicting_appends_report_the_stored_version() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::with_outbox(db.pool.clone());
    let stream = StreamId::new("acc-1");
    let tenant = TenantId::new();

    let (a, b) = tokio::join!(
        store.append(&stream, deposits("acc-1", tenant, 1..=3), 0),
        store.append(&stream, deposits("acc-1", tenant, 1..=2), 0),
    );
    let (winner, loser) = match (a, b) {
        (Ok(version), Err(err)) | (Err(err), Ok(version)) => (version, err),
        other => panic!("expected exactly one append to win, got {other:?}"),
    };
    match loser {
        EventStoreError::ConcurrencyConflict { expected, actual, .. } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, winner);
        }
        other => panic!("expected a concurrency conflict, got {other:?}"),
    }
    assert_eq!(store.get_stream_version(&stream).await.unwrap(), winner);

    // Only the winner's events reached the outbox.
    let outbox = PostgresOutboxStore::new(db.pool.clone());
    assert_eq!(outbox.stats().await.unwrap().pending, winner);

    // Stale writer after the fact.
    let stale = store
        .append(&stream, deposits("acc-1", tenant, 2..=2), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        stale,
        EventStoreError::ConcurrencyConflict { expected: 1, actual, .. } if actual == winner
    ));

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires running Postgres instance"]
async fn reused_event_ids_are_rejected_without_touching_the_stream() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    let tenant = TenantId::new();

    let original = deposits("acc-1", tenant, 1..=1);
    let reused_id = original[0].id();
    store.append(&StreamId::new("acc-1"), original, 0).await.unwrap();

    let copy = DomainEvent::new(StreamId::new("acc-2"), tenant, 1, "Deposited", json!({})).with_id(reused_id);
    let err = store
        .append(&StreamId::new("acc-2"), vec![copy], 0)
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::InvalidAppend(_)), "{err:?}");
    assert!(!store.stream_exists(&StreamId::new("acc-2")).await.unwrap());

    db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires running Postgres instance"]
async fn timestamp_pages_cover_every_event_once() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    let tenant = TenantId::new();
    let t0 = Utc::now();

    for (name, offset) in [("acc-2", 1), ("acc-1", 0)] {
        let events: Vec<DomainEvent> = deposits(name, tenant, 1..=5)
            .into_iter()
            .map(|e| {
                let at = t0 + chrono::Duration::seconds(2 * e.version() as i64 + offset);
                e.with_occurred_at(at)
            })
            .collect();
        store.append(&StreamId::new(name), events, 0).await.unwrap();
    }

    let mut paged = Vec::new();
    let mut after: Option<TimestampPosition> = None;
    loop {
        let page = store
            .get_events_from_timestamp_batch(t0, after.as_ref(), 3)
            .await
            .unwrap();
        let Some(last) = page.last() else { break };
        after = Some(TimestampPosition::of(last));
        paged.extend(page.iter().map(|e| (e.aggregate_id().to_string(), e.version())));
    }

    let whole: Vec<(String, u64)> = store
        .get_events_from_timestamp(t0)
        .await
        .unwrap()
        .iter()
        .map(|e| (e.aggregate_id().to_string(), e.version()))
        .collect();
    assert_eq!(paged.len(), 10);
    assert_eq!(paged, whole);

    db.cleanup().await;
}
