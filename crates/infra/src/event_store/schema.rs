//! Relational schema of the event store, snapshot table and outbox.
//!
//! Statements are idempotent (`IF NOT EXISTS`) so `ensure_schema` can run on
//! every start.

use sqlx::PgPool;

use super::r#trait::EventStoreError;

/// Per-stream version record; the row lock serialises writers of one stream.
pub const CREATE_STREAMS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS streams (
    stream_id   TEXT PRIMARY KEY,
    version     BIGINT NOT NULL DEFAULT 0 CHECK (version >= 0),
    tenant_id   UUID NOT NULL
);
";

pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id              UUID PRIMARY KEY,
    stream_id       TEXT NOT NULL,
    version         BIGINT NOT NULL CHECK (version > 0),
    event_type      TEXT NOT NULL,
    event_data      JSONB NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
    tenant_id       UUID NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    created_by      UUID NULL,
    correlation_id  UUID NULL,
    causation_id    UUID NULL,
    UNIQUE (stream_id, version)
);

CREATE INDEX IF NOT EXISTS idx_events_created_at
    ON events (created_at, stream_id, version);

CREATE INDEX IF NOT EXISTS idx_events_tenant
    ON events (tenant_id, created_at);
";

pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS snapshots (
    stream_id       TEXT PRIMARY KEY,
    version         BIGINT NOT NULL CHECK (version > 0),
    snapshot_data   JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

pub const CREATE_OUTBOX_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS outbox_events (
    id               UUID PRIMARY KEY,
    aggregate_id     TEXT NOT NULL,
    event_type       TEXT NOT NULL,
    event_data       JSONB NOT NULL,
    metadata         JSONB NOT NULL DEFAULT '{}'::jsonb,
    tenant_id        UUID NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at     TIMESTAMPTZ NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'processing', 'done', 'dlq')),
    error_message    TEXT NULL,
    correlation_id   UUID NULL,
    causation_id     UUID NULL,
    next_attempt_at  TIMESTAMPTZ NULL,
    claimed_at       TIMESTAMPTZ NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_claimable
    ON outbox_events (status, created_at)
    WHERE status IN ('pending', 'processing');
";

/// All statements, in creation order.
pub const ALL: &[&str] = &[
    CREATE_STREAMS_TABLE,
    CREATE_EVENTS_TABLE,
    CREATE_SNAPSHOTS_TABLE,
    CREATE_OUTBOX_TABLE,
];

/// Create every table and index this runtime owns.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), EventStoreError> {
    for ddl in ALL {
        sqlx::raw_sql(ddl)
            .execute(pool)
            .await
            .map_err(|e| EventStoreError::storage("ensure_schema", e))?;
    }
    tracing::info!(tables = ALL.len(), "event store schema ensured");
    Ok(())
}
