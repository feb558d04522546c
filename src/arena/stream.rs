//! Thinking-message fan-out.
//!
//! Single publish API for the whole arena subsystem: persist the message,
//! then broadcast it on the arena's bounded channel. Components never write
//! to HTTP directly; SSE handlers subscribe here. Per arena the channel is
//! FIFO; across arenas there is no ordering. A subscriber that falls more
//! than the channel capacity behind is dropped by the broadcast semantics,
//! and the overflow is recorded as a `system` message in the log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::arena::repo::ArenaRepo;
use crate::arena::ThinkingMessage;
use crate::clock::Clock;
use crate::error::Result;

pub const CHANNEL_CAPACITY: usize = 256;

pub struct StreamProcessor {
    repo: Arc<ArenaRepo>,
    clock: Arc<dyn Clock>,
    channels: Mutex<HashMap<String, broadcast::Sender<ThinkingMessage>>>,
}

impl StreamProcessor {
    pub fn new(repo: Arc<ArenaRepo>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, arena_id: &str) -> broadcast::Sender<ThinkingMessage> {
        self.channels
            .lock()
            .entry(arena_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Append to the log, then fan out to live subscribers.
    pub fn publish(&self, msg: ThinkingMessage) -> Result<()> {
        self.repo.append_message(&msg)?;
        let sender = self.sender(&msg.arena_id);
        // No receivers is fine; the log is the durable record.
        let _ = sender.send(msg);
        Ok(())
    }

    /// Live subscription from now on; history is not replayed.
    pub fn subscribe(&self, arena_id: &str) -> broadcast::Receiver<ThinkingMessage> {
        debug!(arena = arena_id, "stream subscriber attached");
        self.sender(arena_id).subscribe()
    }

    /// Record that a subscriber was dropped for falling behind.
    pub fn note_subscriber_overflow(&self, arena_id: &str, skipped: u64) {
        warn!(arena = arena_id, skipped, "slow stream subscriber dropped");
        let msg = ThinkingMessage::system(
            arena_id,
            &format!("subscriber dropped after missing {skipped} messages"),
            self.clock.now(),
        );
        if let Err(e) = self.publish(msg) {
            warn!(arena = arena_id, error = %e, "failed to record overflow");
        }
    }

    /// Tear down the channel when an arena is deleted.
    pub fn remove(&self, arena_id: &str) {
        self.channels.lock().remove(arena_id);
    }
}
