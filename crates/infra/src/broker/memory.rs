//! In-process broker for tests and local runs.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{BrokerError, MessageSource, MessageTransport, OutgoingMessage, ReceivedMessage};

#[derive(Debug, Default)]
struct State {
    /// topic -> partition -> log
    topics: HashMap<String, Vec<Vec<ReceivedMessage>>>,
    /// Last committed offset (inclusive) per topic-partition.
    committed: HashMap<(String, i32), i64>,
    subscriptions: HashSet<String>,
    failing_sends: u32,
    failing_polls: u32,
}

/// Partitioned, append-only topic logs with a single consumer group.
///
/// `poll` starts after the committed offset of every partition, so anything
/// not committed is delivered again on the next poll.
#[derive(Debug)]
pub struct InMemoryBroker {
    partitions: usize,
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn partition_for(&self, key: Option<&str>) -> i32 {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as i32
            }
            None => 0,
        }
    }

    /// The next `n` sends fail with a publish error.
    pub fn fail_next_sends(&self, n: u32) {
        self.state().failing_sends = n;
    }

    /// The next `n` polls fail with a consume error.
    pub fn fail_next_polls(&self, n: u32) {
        self.state().failing_polls = n;
    }

    /// Append raw bytes, bypassing the producer. Returns `(partition, offset)`.
    pub fn publish_raw(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> (i32, i64) {
        let partition = self.partition_for(key);
        let mut state = self.state();
        let offset = append(
            &mut state,
            self.partitions,
            topic,
            partition,
            key.map(str::to_string),
            payload,
            Vec::new(),
        );
        (partition, offset)
    }

    /// Every message on `topic`, partition by partition in offset order.
    pub fn messages(&self, topic: &str) -> Vec<ReceivedMessage> {
        self.state()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

fn append(
    state: &mut State,
    partitions: usize,
    topic: &str,
    partition: i32,
    key: Option<String>,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
) -> i64 {
    let logs = state
        .topics
        .entry(topic.to_string())
        .or_insert_with(|| vec![Vec::new(); partitions]);
    let log = &mut logs[partition as usize];
    let offset = log.len() as i64;
    log.push(ReceivedMessage {
        topic: topic.to_string(),
        partition,
        offset,
        timestamp: Utc::now(),
        key,
        payload,
        headers,
    });
    offset
}

#[async_trait]
impl MessageTransport for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        let partition = self.partition_for(Some(&message.key));
        let mut state = self.state();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(BrokerError::Publish {
                topic: message.topic,
                message: "injected send failure".to_string(),
            });
        }
        append(
            &mut state,
            self.partitions,
            &message.topic,
            partition,
            Some(message.key),
            message.payload,
            message.headers,
        );
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        self.state().subscriptions.extend(topics.iter().cloned());
        Ok(())
    }

    async fn poll(&self, max: usize, _timeout: Duration) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut state = self.state();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(BrokerError::Consume("injected poll failure".to_string()));
        }

        let mut topics: Vec<&String> = state.subscriptions.iter().collect();
        topics.sort();

        let mut batch = Vec::new();
        for topic in topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (partition, log) in partitions.iter().enumerate() {
                let start = state
                    .committed
                    .get(&(topic.clone(), partition as i32))
                    .map_or(0, |offset| offset + 1) as usize;
                for message in log.iter().skip(start) {
                    if batch.len() >= max {
                        return Ok(batch);
                    }
                    batch.push(message.clone());
                }
            }
        }
        Ok(batch)
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.state();
        let committed = state
            .committed
            .entry((topic.to_string(), partition))
            .or_insert(offset);
        *committed = (*committed).max(offset);
        Ok(())
    }

    /// Every poll already starts after the committed offset, so uncommitted
    /// messages come back without moving anything.
    async fn rewind(&self, _topic: &str, _partition: i32, _offset: i64) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(topic: &str, key: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: body.as_bytes().to_vec(),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn same_key_lands_on_one_partition_in_order() {
        let broker = InMemoryBroker::new(8);
        for body in ["a", "b", "c"] {
            broker.send(outgoing("t", "acc-1", body)).await.unwrap();
        }

        let messages = broker.messages("t");
        let partition = broker.partition_for(Some("acc-1"));
        assert!(messages.iter().all(|m| m.partition == partition));
        let offsets: Vec<i64> = messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered() {
        let broker = InMemoryBroker::new(1);
        broker.subscribe(&["t".to_string()]).await.unwrap();
        for body in ["a", "b", "c"] {
            broker.send(outgoing("t", "k", body)).await.unwrap();
        }

        let first = broker.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 3);

        broker.commit("t", 0, 0).await.unwrap();
        let second = broker.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(broker.committed("t", 0), Some(0));
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_not_polled() {
        let broker = InMemoryBroker::new(1);
        broker.subscribe(&["wanted".to_string()]).await.unwrap();
        broker.publish_raw("other", None, b"x".to_vec());
        assert!(broker.poll(10, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(1);
        broker.fail_next_polls(1);

        assert!(matches!(
            broker.send(outgoing("t", "k", "a")).await,
            Err(BrokerError::Publish { .. })
        ));
        assert!(broker.send(outgoing("t", "k", "a")).await.is_ok());
        assert!(matches!(
            broker.poll(1, Duration::ZERO).await,
            Err(BrokerError::Consume(_))
        ));
        assert!(broker.poll(1, Duration::ZERO).await.is_ok());
    }
}
