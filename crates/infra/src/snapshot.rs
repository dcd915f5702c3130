//! Aggregate snapshots.
//!
//! A snapshot stores the folded state of a stream at some version so a rebuild
//! only replays the tail. Snapshots are advisory: a missing or unreadable one
//! costs a full replay, never a wrong answer.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventide_core::{Aggregate, StreamId, TenantId};
use eventide_events::{AggregateError, AggregateRoot, Event, UpcastError, UpcasterPipeline};

use crate::config::SnapshotConfig;
use crate::event_store::{EventStore, EventStoreError, Snapshot};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error("cannot snapshot {stream_id}: {reason}")]
    NotSnapshottable { stream_id: StreamId, reason: String },

    #[error("incompatible snapshot for {stream_id}: {reason}")]
    IncompatibleSnapshot { stream_id: StreamId, reason: String },

    #[error("snapshot encoding failed for {stream_id}: {message}")]
    Encode { stream_id: StreamId, message: String },
}

/// Explicit, versioned conversion between aggregate state and snapshot data.
///
/// Bump [`SnapshotCodec::version`] whenever the encoded shape changes; older
/// snapshots then fail to decode and the aggregate is rebuilt from events.
pub trait SnapshotCodec<A: Aggregate>: Send + Sync {
    fn version(&self) -> u32;

    fn encode(&self, root: &AggregateRoot<A>) -> Result<JsonValue, SnapshotError>;

    /// Restore a root positioned at `snapshot.version`.
    fn decode(&self, snapshot: &Snapshot) -> Result<AggregateRoot<A>, SnapshotError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<S> {
    aggregate_type: String,
    codec_version: u32,
    tenant_id: TenantId,
    state: S,
}

/// serde-based codec storing `{aggregateType, codecVersion, tenantId, state}`.
pub struct JsonSnapshotCodec<A> {
    version: u32,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> JsonSnapshotCodec<A> {
    pub fn new() -> Self {
        Self::with_version(1)
    }

    pub fn with_version(version: u32) -> Self {
        Self {
            version,
            _aggregate: PhantomData,
        }
    }
}

impl<A> Default for JsonSnapshotCodec<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> std::fmt::Debug for JsonSnapshotCodec<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSnapshotCodec")
            .field("version", &self.version)
            .finish()
    }
}

impl<A> SnapshotCodec<A> for JsonSnapshotCodec<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
    A::Event: Event,
{
    fn version(&self) -> u32 {
        self.version
    }

    fn encode(&self, root: &AggregateRoot<A>) -> Result<JsonValue, SnapshotError> {
        let envelope = Envelope {
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            codec_version: self.version,
            tenant_id: root.tenant_id(),
            state: root.state(),
        };
        serde_json::to_value(&envelope).map_err(|e| SnapshotError::Encode {
            stream_id: root.id().clone(),
            message: e.to_string(),
        })
    }

    fn decode(&self, snapshot: &Snapshot) -> Result<AggregateRoot<A>, SnapshotError> {
        let incompatible = |reason: String| SnapshotError::IncompatibleSnapshot {
            stream_id: snapshot.stream_id.clone(),
            reason,
        };

        let envelope: Envelope<JsonValue> = serde_json::from_value(snapshot.snapshot_data.clone())
            .map_err(|e| incompatible(format!("not a snapshot envelope: {e}")))?;

        if envelope.aggregate_type != A::AGGREGATE_TYPE {
            return Err(incompatible(format!(
                "aggregate type {} (expected {})",
                envelope.aggregate_type,
                A::AGGREGATE_TYPE
            )));
        }
        if envelope.codec_version != self.version {
            return Err(incompatible(format!(
                "codec version {} (expected {})",
                envelope.codec_version, self.version
            )));
        }

        let state: A = serde_json::from_value(envelope.state)
            .map_err(|e| incompatible(format!("state does not decode: {e}")))?;

        Ok(AggregateRoot::from_snapshot(
            snapshot.stream_id.clone(),
            envelope.tenant_id,
            snapshot.version,
            state,
        ))
    }
}

/// Creates snapshots on a version threshold and rebuilds aggregates from
/// snapshot + tail.
#[derive(Debug, Clone)]
pub struct SnapshotManager<S> {
    store: S,
    threshold: u64,
    upcasters: Option<Arc<UpcasterPipeline>>,
}

impl<S: EventStore> SnapshotManager<S> {
    pub fn new(store: S, config: SnapshotConfig) -> Self {
        Self {
            store,
            threshold: config.threshold,
            upcasters: None,
        }
    }

    /// Upcast stored events before they are applied during a rebuild.
    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterPipeline>) -> Self {
        self.upcasters = Some(upcasters);
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn should_snapshot(&self, version: u64) -> bool {
        self.threshold > 0 && version > 0 && version % self.threshold == 0
    }

    /// Snapshot `root` when its version sits on the threshold.
    ///
    /// Returns whether a snapshot was written. Roots with uncommitted events
    /// are never snapshotted: their state is ahead of the store.
    pub async fn create_snapshot_if_needed<A, C>(
        &self,
        root: &AggregateRoot<A>,
        codec: &C,
    ) -> Result<bool, SnapshotError>
    where
        A: Aggregate,
        A::Event: Event,
        C: SnapshotCodec<A> + ?Sized,
    {
        if root.has_uncommitted_events() || !self.should_snapshot(root.version()) {
            return Ok(false);
        }
        self.take_snapshot(root, codec).await?;
        Ok(true)
    }

    /// Snapshot `root` unconditionally.
    pub async fn take_snapshot<A, C>(&self, root: &AggregateRoot<A>, codec: &C) -> Result<(), SnapshotError>
    where
        A: Aggregate,
        A::Event: Event,
        C: SnapshotCodec<A> + ?Sized,
    {
        if root.has_uncommitted_events() {
            return Err(SnapshotError::NotSnapshottable {
                stream_id: root.id().clone(),
                reason: format!("{} uncommitted events", root.uncommitted_events().len()),
            });
        }

        let data = codec.encode(root)?;
        self.store
            .create_snapshot(Snapshot::new(root.id().clone(), root.version(), data))
            .await?;

        tracing::info!(
            stream_id = %root.id(),
            version = root.version(),
            aggregate_type = A::AGGREGATE_TYPE,
            "snapshot created"
        );
        Ok(())
    }

    /// Rebuild an aggregate from its latest snapshot (if usable) plus the
    /// events after it, or from the full stream otherwise.
    pub async fn rebuild_aggregate<A, C>(
        &self,
        stream_id: &StreamId,
        codec: &C,
    ) -> Result<AggregateRoot<A>, SnapshotError>
    where
        A: Aggregate,
        A::Event: Event,
        C: SnapshotCodec<A> + ?Sized,
    {
        let restored = match self.store.get_snapshot(stream_id).await? {
            Some(snapshot) => match codec.decode(&snapshot) {
                Ok(root) => Some(root),
                Err(e) => {
                    tracing::warn!(
                        stream_id = %stream_id,
                        snapshot_version = snapshot.version,
                        error = %e,
                        "ignoring unusable snapshot, replaying full stream"
                    );
                    None
                }
            },
            None => None,
        };

        let from_version = restored.as_ref().map(|r| r.version() + 1).unwrap_or(1);
        let mut events = self.store.get_events(stream_id, from_version).await?;
        if let Some(upcasters) = &self.upcasters {
            events = upcasters.upcast_all(events)?;
        }

        let mut root = match restored {
            Some(root) => root,
            None => {
                let Some(first) = events.first() else {
                    return Err(EventStoreError::StreamNotFound(stream_id.clone()).into());
                };
                AggregateRoot::new(stream_id.clone(), first.tenant_id())
            }
        };

        root.load_from_history(&events)?;
        tracing::debug!(
            stream_id = %stream_id,
            version = root.version(),
            replayed = events.len(),
            "aggregate rebuilt"
        );
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use eventide_events::{FieldUpcaster, Transform};

    use crate::event_store::InMemoryEventStore;
    use crate::testing::{LedgerAccount, LedgerEvent, ledger};

    use super::*;

    fn manager(threshold: u64) -> SnapshotManager<Arc<InMemoryEventStore>> {
        SnapshotManager::new(Arc::new(InMemoryEventStore::new()), SnapshotConfig { threshold })
    }

    async fn commit(
        store: &InMemoryEventStore,
        root: &mut AggregateRoot<LedgerAccount>,
    ) -> u64 {
        let version = store
            .append(root.id(), root.uncommitted_events().to_vec(), root.expected_version())
            .await
            .unwrap();
        root.mark_committed();
        version
    }

    #[tokio::test]
    async fn snapshots_only_on_threshold() {
        let manager = manager(5);
        let codec = JsonSnapshotCodec::<LedgerAccount>::new();
        let tenant = TenantId::new();

        let mut root = ledger("acc-1", tenant, 3);
        assert!(!manager.create_snapshot_if_needed(&root, &codec).await.unwrap());
        commit(&manager.store, &mut root).await;
        assert!(!manager.create_snapshot_if_needed(&root, &codec).await.unwrap());

        root.add_event(LedgerEvent::Deposited { amount: 10 }).unwrap();
        commit(&manager.store, &mut root).await;
        assert_eq!(root.version(), 5);
        assert!(manager.create_snapshot_if_needed(&root, &codec).await.unwrap());

        let snapshot = manager.store.get_snapshot(root.id()).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.snapshot_data["aggregateType"], json!("test.ledger_account"));
        assert_eq!(snapshot.snapshot_data["codecVersion"], json!(1));
    }

    #[tokio::test]
    async fn rebuild_with_and_without_snapshot_agree() {
        let manager = manager(4);
        let codec = JsonSnapshotCodec::<LedgerAccount>::new();
        let tenant = TenantId::new();

        let mut root = ledger("acc-1", tenant, 3);
        commit(&manager.store, &mut root).await;
        assert!(manager.create_snapshot_if_needed(&root, &codec).await.unwrap());

        for amount in [7, 11, 13] {
            root.add_event(LedgerEvent::Deposited { amount }).unwrap();
        }
        root.add_event(LedgerEvent::Withdrawn { amount: 5 }).unwrap();
        commit(&manager.store, &mut root).await;

        let from_snapshot = manager.rebuild_aggregate(root.id(), &codec).await.unwrap();

        manager.store.delete_stream(root.id()).await.unwrap();
        let mut again = ledger("acc-1", tenant, 3);
        for amount in [7, 11, 13] {
            again.add_event(LedgerEvent::Deposited { amount }).unwrap();
        }
        again.add_event(LedgerEvent::Withdrawn { amount: 5 }).unwrap();
        commit(&manager.store, &mut again).await;
        assert!(manager.store.get_snapshot(again.id()).await.unwrap().is_none());
        let from_events = manager.rebuild_aggregate(again.id(), &codec).await.unwrap();

        assert_eq!(from_snapshot.state(), from_events.state());
        assert_eq!(from_snapshot.version(), 8);
        assert_eq!(from_events.version(), 8);
        assert_eq!(from_snapshot.state().balance, 1 + 2 + 3 + 7 + 11 + 13 - 5);
    }

    #[tokio::test]
    async fn incompatible_snapshot_falls_back_to_full_replay() {
        let manager = manager(4);
        let tenant = TenantId::new();
        let mut root = ledger("acc-1", tenant, 3);
        commit(&manager.store, &mut root).await;

        let data = JsonSnapshotCodec::<LedgerAccount>::new().encode(&root).unwrap();
        manager
            .store
            .create_snapshot(Snapshot::new(root.id().clone(), 4, data))
            .await
            .unwrap();

        let v2 = JsonSnapshotCodec::<LedgerAccount>::with_version(2);
        let snapshot = manager.store.get_snapshot(root.id()).await.unwrap().unwrap();
        assert!(matches!(
            v2.decode(&snapshot),
            Err(SnapshotError::IncompatibleSnapshot { .. })
        ));

        let rebuilt = manager.rebuild_aggregate(root.id(), &v2).await.unwrap();
        assert_eq!(rebuilt.state(), root.state());
        assert_eq!(rebuilt.version(), 4);
    }

    #[tokio::test]
    async fn missing_stream_is_reported() {
        let manager = manager(4);
        let codec = JsonSnapshotCodec::<LedgerAccount>::new();
        let err = manager
            .rebuild_aggregate::<LedgerAccount, _>(&StreamId::new("nope"), &codec)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Store(EventStoreError::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn uncommitted_roots_cannot_be_snapshotted() {
        let manager = manager(1);
        let codec = JsonSnapshotCodec::<LedgerAccount>::new();
        let root = ledger("acc-1", TenantId::new(), 0);
        assert!(matches!(
            manager.take_snapshot(&root, &codec).await,
            Err(SnapshotError::NotSnapshottable { .. })
        ));
    }

    #[tokio::test]
    async fn rebuild_applies_upcasters_to_stored_events() {
        let pipeline = UpcasterPipeline::new().with(Arc::new(
            FieldUpcaster::new("deposit-amount-rename", "Deposited")
                .then(Transform::rename_field("value", "amount")),
        ));
        let manager = manager(100).with_upcasters(Arc::new(pipeline));
        let codec = JsonSnapshotCodec::<LedgerAccount>::new();
        let tenant = TenantId::new();

        let mut root = ledger("acc-1", tenant, 0);
        commit(&manager.store, &mut root).await;
        let legacy = eventide_events::DomainEvent::new(
            root.id().clone(),
            tenant,
            2,
            "Deposited",
            json!({"value": 40}),
        );
        manager.store.append(root.id(), vec![legacy], 1).await.unwrap();

        let rebuilt = manager.rebuild_aggregate(root.id(), &codec).await.unwrap();
        assert_eq!(rebuilt.state().balance, 40);
    }
}
