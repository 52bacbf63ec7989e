/// Bounded FIFO deque of received messages, keyed by UUID.
///
/// Mirrors the mutex-guarded-collection idiom used elsewhere in the bridge
/// (the AddressBook's exclusive lock, the Bridge's queues): a single async
/// mutex around a `VecDeque`, never held across an I/O await point.
use std::collections::VecDeque;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::converters::ReceivedEvent;
use crate::error::BridgeError;

#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub uuid: String,
    pub from_jid: String,
    pub body: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InboxStats {
    pub total: usize,
    pub capacity: usize,
    pub utilization_percent: u8,
}

pub struct Inbox {
    capacity: usize,
    records: Mutex<VecDeque<InboxRecord>>,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends a received message, evicting the oldest record if at capacity.
    /// Returns the newly generated UUID.
    pub async fn append(&self, event: ReceivedEvent) -> String {
        let uuid = Uuid::new_v4().to_string();
        let record = InboxRecord {
            uuid: uuid.clone(),
            from_jid: event.from_jid,
            body: event.body,
            ts: event.ts,
        };

        let mut records = self.records.lock().await;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        uuid
    }

    /// Returns up to `limit` records, newest first.
    pub async fn list(&self, limit: Option<usize>) -> Vec<InboxRecord> {
        let records = self.records.lock().await;
        let iter = records.iter().rev().cloned();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub async fn get(&self, uuid: &str) -> Result<InboxRecord, BridgeError> {
        let records = self.records.lock().await;
        records
            .iter()
            .find(|r| r.uuid == uuid)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound { id: uuid.to_string() })
    }

    /// Clears all records, returning the count removed.
    pub async fn clear(&self) -> usize {
        let mut records = self.records.lock().await;
        let count = records.len();
        records.clear();
        count
    }

    pub async fn stats(&self) -> InboxStats {
        let records = self.records.lock().await;
        let total = records.len();
        let utilization_percent = if self.capacity == 0 {
            0
        } else {
            ((total as f64 / self.capacity as f64) * 100.0).round() as u8
        };
        InboxStats {
            total,
            capacity: self.capacity,
            utilization_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(from: &str, body: &str, ts: u64) -> ReceivedEvent {
        ReceivedEvent {
            from_jid: from.to_string(),
            body: body.to_string(),
            message_type: "chat".to_string(),
            ts,
        }
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let inbox = Inbox::new(10);
        let uuid = inbox.append(event("alice@example.com", "hi", 1)).await;
        let record = inbox.get(&uuid).await.unwrap();
        assert_eq!(record.from_jid, "alice@example.com");
        assert_eq!(record.body, "hi");
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let inbox = Inbox::new(10);
        let err = inbox.get("nonexistent").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_eviction_at_capacity() {
        let inbox = Inbox::new(2);
        let first = inbox.append(event("a@x.com", "first", 1)).await;
        inbox.append(event("b@x.com", "second", 2)).await;
        inbox.append(event("c@x.com", "third", 3)).await;

        assert!(inbox.get(&first).await.is_err());
        let stats = inbox.stats().await;
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let inbox = Inbox::new(10);
        inbox.append(event("a@x.com", "one", 1)).await;
        inbox.append(event("b@x.com", "two", 2)).await;
        inbox.append(event("c@x.com", "three", 3)).await;

        let listed = inbox.list(None).await;
        assert_eq!(listed[0].body, "three");
        assert_eq!(listed[1].body, "two");
        assert_eq!(listed[2].body, "one");
    }

    #[tokio::test]
    async fn test_list_respects_limit() {
        let inbox = Inbox::new(10);
        for i in 0..5 {
            inbox.append(event("a@x.com", &format!("msg{i}"), i)).await;
        }
        let listed = inbox.list(Some(2)).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].body, "msg4");
    }

    #[tokio::test]
    async fn test_clear_then_clear_again() {
        let inbox = Inbox::new(10);
        inbox.append(event("a@x.com", "one", 1)).await;
        inbox.append(event("b@x.com", "two", 2)).await;

        assert_eq!(inbox.clear().await, 2);
        assert_eq!(inbox.clear().await, 0);
    }

    #[tokio::test]
    async fn test_stats_utilization() {
        let inbox = Inbox::new(4);
        inbox.append(event("a@x.com", "one", 1)).await;
        let stats = inbox.stats().await;
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.utilization_percent, 25);
    }
}
