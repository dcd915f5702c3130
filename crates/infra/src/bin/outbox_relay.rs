//! Relays committed events from the Postgres outbox to Kafka.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use eventide_infra::broker::{EventProducer, KafkaTransport, TopicRouter};
use eventide_infra::config::RuntimeConfig;
use eventide_infra::event_store::PostgresEventStore;
use eventide_infra::outbox::{OutboxWorker, PostgresOutboxStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventide_observability::init();

    let config = RuntimeConfig::from_env().context("reading configuration")?;
    let database_url = config
        .event_store
        .database_url
        .clone()
        .context("EVENTIDE_DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.event_store.max_connections)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;

    PostgresEventStore::with_outbox(pool.clone())
        .ensure_schema()
        .await
        .context("creating event store schema")?;

    let transport = KafkaTransport::new(&config.broker).context("creating kafka producer")?;
    let producer = EventProducer::new(Arc::new(transport), TopicRouter::from_config(&config.broker));
    producer.connect().await.context("connecting to kafka")?;

    let worker = OutboxWorker::new(
        Arc::new(PostgresOutboxStore::new(pool)),
        Arc::new(producer),
        config.outbox.clone(),
    )
    .with_name("outbox-relay");

    tracing::info!(
        poll_interval_ms = config.outbox.poll_interval.as_millis() as u64,
        batch_size = config.outbox.batch_size,
        brokers = %config.broker.brokers,
        "outbox relay started"
    );
    let handle = worker.spawn();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    match handle.report().await {
        Ok(report) => tracing::info!(
            processed = report.metrics.processed,
            failed = report.metrics.failed,
            dlq = report.metrics.dlq,
            avg_processing_ms = report.metrics.avg_processing_ms,
            pending = report.stats.pending,
            dead_lettered = report.stats.dlq,
            "outbox relay stopping"
        ),
        Err(err) => tracing::warn!(error = %err, "could not read outbox stats"),
    }

    let metrics = handle.shutdown().await;
    tracing::info!(
        processed = metrics.processed,
        failed = metrics.failed,
        dlq = metrics.dlq,
        "outbox relay stopped"
    );
    Ok(())
}
