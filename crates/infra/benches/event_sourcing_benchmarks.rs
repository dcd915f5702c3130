use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use eventide_core::{Aggregate, StreamId, TenantId};
use eventide_events::{AggregateRoot, DomainEvent, Event, FnHandler, HandlerRegistry};
use eventide_infra::config::{ReplayConfig, SnapshotConfig};
use eventide_infra::event_store::{EventStore, InMemoryEventStore};
use eventide_infra::replay::ReplayEngine;
use eventide_infra::snapshot::{JsonSnapshotCodec, SnapshotManager};

/// Events replayed after the snapshot in the snapshot-rebuild case.
const TAIL: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StockEvent {
    Received { quantity: i64 },
    Shipped { quantity: i64 },
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Received { .. } => "StockReceived",
            Self::Shipped { .. } => "StockShipped",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StockLevel {
    on_hand: i64,
    movements: u64,
}

impl Aggregate for StockLevel {
    type Event = StockEvent;
    const AGGREGATE_TYPE: &'static str = "bench.stock_level";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::Received { quantity } => self.on_hand += quantity,
            StockEvent::Shipped { quantity } => self.on_hand -= quantity,
        }
        self.movements += 1;
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime")
}

fn movements(stream_id: &StreamId, tenant_id: TenantId, count: u64) -> Vec<DomainEvent> {
    let mut root = AggregateRoot::<StockLevel>::new(stream_id.clone(), tenant_id);
    for i in 0..count {
        let event = if i % 3 == 2 {
            StockEvent::Shipped { quantity: 1 }
        } else {
            StockEvent::Received { quantity: 2 }
        };
        root.add_event(event).expect("encode event");
    }
    root.uncommitted_events().to_vec()
}

/// A store holding one stream of `count` events, optionally snapshotted
/// `TAIL` events before its head.
fn seeded_store(rt: &Runtime, count: u64, snapshot: bool) -> (Arc<InMemoryEventStore>, StreamId) {
    let store = Arc::new(InMemoryEventStore::new());
    let stream_id = StreamId::new("stock-1");
    let tenant_id = TenantId::new();

    rt.block_on(async {
        let events = movements(&stream_id, tenant_id, count);
        let split = if snapshot { (count - TAIL) as usize } else { events.len() };
        let (head, tail) = events.split_at(split);

        store.append(&stream_id, head.to_vec(), 0).await.expect("append");
        if snapshot {
            let manager = SnapshotManager::new(store.clone(), SnapshotConfig { threshold: 1 });
            let codec = JsonSnapshotCodec::<StockLevel>::new();
            let root = manager
                .rebuild_aggregate::<StockLevel, _>(&stream_id, &codec)
                .await
                .expect("rebuild");
            manager.take_snapshot(&root, &codec).await.expect("snapshot");
            store
                .append(&stream_id, tail.to_vec(), split as u64)
                .await
                .expect("append tail");
        }
    });
    (store, stream_id)
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");
    let rt = runtime();

    for batch_size in [1u64, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            &batch_size,
            |b, &size| {
                let store = InMemoryEventStore::new();
                let tenant_id = TenantId::new();

                b.iter(|| {
                    let stream_id = StreamId::new(uuid::Uuid::now_v7().to_string());
                    let events = movements(&stream_id, tenant_id, size);
                    black_box(
                        rt.block_on(store.append(&stream_id, events, 0))
                            .expect("append"),
                    );
                });
            },
        );
    }

    group.finish();
}

fn bench_aggregate_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_rebuild");
    let rt = runtime();
    let codec = JsonSnapshotCodec::<StockLevel>::new();

    for event_count in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(event_count));

        let (store, stream_id) = seeded_store(&rt, event_count, false);
        let manager = SnapshotManager::new(store, SnapshotConfig::default());
        group.bench_with_input(
            BenchmarkId::new("full_replay", event_count),
            &event_count,
            |b, _| {
                b.iter(|| {
                    let root = rt
                        .block_on(manager.rebuild_aggregate::<StockLevel, _>(&stream_id, &codec))
                        .expect("rebuild");
                    black_box(root.state().on_hand)
                });
            },
        );

        let (store, stream_id) = seeded_store(&rt, event_count, true);
        let manager = SnapshotManager::new(store, SnapshotConfig::default());
        group.bench_with_input(
            BenchmarkId::new("snapshot_plus_tail", event_count),
            &event_count,
            |b, _| {
                b.iter(|| {
                    let root = rt
                        .block_on(manager.rebuild_aggregate::<StockLevel, _>(&stream_id, &codec))
                        .expect("rebuild");
                    black_box(root.state().on_hand)
                });
            },
        );
    }

    group.finish();
}

fn bench_replay_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_throughput");
    let rt = runtime();

    for event_count in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(event_count));

        let (store, stream_id) = seeded_store(&rt, event_count, false);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let handler = FnHandler::new("counter", &[], move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok::<(), anyhow::Error>(())
            }
        });
        let engine = ReplayEngine::new(
            store,
            HandlerRegistry::new().with(Arc::new(handler)),
            ReplayConfig::default(),
        );

        group.bench_with_input(
            BenchmarkId::new("replay_stream", event_count),
            &event_count,
            |b, _| {
                b.iter(|| {
                    let report = rt
                        .block_on(engine.replay_stream(&stream_id, 1))
                        .expect("replay");
                    black_box(report.events_processed)
                });
            },
        );
        black_box(seen.load(Ordering::Relaxed));
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append_throughput,
    bench_aggregate_rebuild,
    bench_replay_throughput
);
criterion_main!(benches);
