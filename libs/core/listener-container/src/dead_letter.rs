//! Dead letters
//!
//! Deliveries the container gives up on are handed to a [`DeadLetterSink`]
//! before they are discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::delivery::Delivery;
use crate::error::Result;

/// A delivery that will not be processed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub queue: String,
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
    pub reason: String,
    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_delivery(delivery: &Delivery, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: delivery.queue.clone(),
            message_id: delivery.message_id.clone(),
            payload: delivery.payload.clone(),
            reason: reason.into(),
            delivery_count: delivery.delivery_count,
            failed_at: Utc::now(),
        }
    }

    /// Payload as text, lossy for non-UTF-8 bodies
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<()>;
}

/// Dead-letter statistics
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub length: usize,
    pub total_received: u64,
    /// Entries evicted because the queue was full
    pub evicted: u64,
    pub oldest_failed_at: Option<DateTime<Utc>>,
    pub newest_failed_at: Option<DateTime<Utc>>,
}

struct DeadLetterState {
    entries: VecDeque<DeadLetterEntry>,
    total_received: u64,
    evicted: u64,
}

/// Bounded in-process dead-letter queue. The oldest entry is evicted when full.
pub struct InMemoryDeadLetterQueue {
    state: Mutex<DeadLetterState>,
    max_length: usize,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeadLetterState {
                entries: VecDeque::new(),
                total_received: 0,
                evicted: 0,
            }),
            max_length: 10_000,
        }
    }

    /// Set the maximum number of retained entries
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, DeadLetterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` entries, oldest first
    pub fn list(&self, count: usize) -> Vec<DeadLetterEntry> {
        self.lock().entries.iter().take(count).cloned().collect()
    }

    /// Look up an entry by id
    pub fn get(&self, id: Uuid) -> Option<DeadLetterEntry> {
        self.lock().entries.iter().find(|entry| entry.id == id).cloned()
    }

    pub fn stats(&self) -> DeadLetterStats {
        let state = self.lock();
        DeadLetterStats {
            length: state.entries.len(),
            total_received: state.total_received,
            evicted: state.evicted,
            oldest_failed_at: state.entries.front().map(|entry| entry.failed_at),
            newest_failed_at: state.entries.back().map(|entry| entry.failed_at),
        }
    }

    /// Remove and return every entry, e.g. for replay
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        self.lock().entries.drain(..).collect()
    }

    /// Drop every entry, returning how many were removed
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let purged = state.entries.len();
        state.entries.clear();
        info!(purged, "Purged dead letters");
        purged
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut state = self.lock();
        if state.entries.len() >= self.max_length {
            state.entries.pop_front();
            state.evicted += 1;
        }
        debug!(
            id = %entry.id,
            queue = %entry.queue,
            reason = %entry.reason,
            delivery_count = entry.delivery_count,
            "Stored dead letter"
        );
        state.entries.push_back(entry);
        state.total_received += 1;
        Ok(())
    }
}
