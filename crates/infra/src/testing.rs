//! Shared fixtures for infra tests.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use eventide_core::{Aggregate, StreamId, TenantId};
use eventide_events::{AggregateRoot, DomainEvent, Event, FnHandler};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Opened { owner: String },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "Opened",
            Self::Deposited { .. } => "Deposited",
            Self::Withdrawn { .. } => "Withdrawn",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub owner: Option<String>,
    pub balance: i64,
    pub entries: u64,
}

impl Aggregate for LedgerAccount {
    type Event = LedgerEvent;
    const AGGREGATE_TYPE: &'static str = "test.ledger_account";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::Opened { owner } => self.owner = Some(owner.clone()),
            LedgerEvent::Deposited { amount } => {
                self.balance += amount;
                self.entries += 1;
            }
            LedgerEvent::Withdrawn { amount } => {
                self.balance -= amount;
                self.entries += 1;
            }
        }
    }
}

/// Account opened by `owner` followed by `deposits` deposits of 1..=n,
/// still uncommitted.
pub fn ledger(stream: &str, tenant: TenantId, deposits: i64) -> AggregateRoot<LedgerAccount> {
    let mut root = AggregateRoot::new(StreamId::new(stream), tenant);
    root.add_event(LedgerEvent::Opened { owner: "alice".into() })
        .expect("encode Opened");
    for amount in 1..=deposits {
        root.add_event(LedgerEvent::Deposited { amount })
            .expect("encode Deposited");
    }
    root
}

/// Handler that records `(stream, version)` of every event it sees.
pub fn recording_handler(
    name: &str,
    event_types: &[&str],
) -> (Arc<FnHandler>, Arc<Mutex<Vec<(String, u64)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = FnHandler::new(name, event_types, move |event: DomainEvent| {
        let sink = sink.clone();
        async move {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((event.aggregate_id().to_string(), event.version()));
            Ok::<(), anyhow::Error>(())
        }
    });
    (Arc::new(handler), seen)
}

pub fn seen(log: &Mutex<Vec<(String, u64)>>) -> Vec<(String, u64)> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}
