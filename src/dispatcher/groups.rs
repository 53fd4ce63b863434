//! Media-group aggregation
//!
//! Album messages arrive as individual events sharing a `grouped_id`.
//! They buffer in a per-group map; each arrival extends a sliding window
//! (up to the hard cap measured from the first arrival), and on expiry the
//! whole group flushes as one batch. Removal from the buffer and the flush
//! happen atomically on the map entry.

use crate::protocol::ChatMessage;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Aggregation window tuning.
#[derive(Debug, Clone)]
pub struct GroupAggregatorConfig {
    /// Sliding window extended by each arrival
    pub window: Duration,
    /// Hard cap measured from the first arrival
    pub max_wait: Duration,
}

impl Default for GroupAggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(2),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// One flushed media group.
#[derive(Debug)]
pub struct GroupBatch {
    pub group_id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub messages: Vec<ChatMessage>,
}

struct PendingGroup {
    user_id: i64,
    chat_id: i64,
    messages: Vec<ChatMessage>,
    first_at: Instant,
    deadline: Instant,
}

type Sink = dyn Fn(GroupBatch) -> BoxFuture<'static, ()> + Send + Sync;

/// Buffers grouped messages until their window closes.
pub struct GroupAggregator {
    pending: Arc<DashMap<String, PendingGroup>>,
    config: GroupAggregatorConfig,
    sink: Arc<Sink>,
}

impl GroupAggregator {
    pub fn new<F, Fut>(config: GroupAggregatorConfig, sink: F) -> Self
    where
        F: Fn(GroupBatch) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            pending: Arc::new(DashMap::new()),
            config,
            sink: Arc::new(move |batch| Box::pin(sink(batch))),
        }
    }

    /// Number of groups currently buffered.
    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }

    /// Buffer one grouped message. The first arrival for a group spawns
    /// its flush timer.
    pub fn add(&self, group_id: &str, user_id: i64, chat_id: i64, message: ChatMessage) {
        let now = Instant::now();
        let mut spawn_timer = false;

        {
            let mut entry = self
                .pending
                .entry(group_id.to_string())
                .or_insert_with(|| {
                    spawn_timer = true;
                    PendingGroup {
                        user_id,
                        chat_id,
                        messages: Vec::new(),
                        first_at: now,
                        deadline: now + self.config.window,
                    }
                });
            entry.messages.push(message);
            // Each arrival slides the window, bounded by the cap.
            let cap = entry.first_at + self.config.max_wait;
            entry.deadline = (now + self.config.window).min(cap);
        }

        if spawn_timer {
            let pending = Arc::clone(&self.pending);
            let sink = Arc::clone(&self.sink);
            let group_id = group_id.to_string();
            tokio::spawn(async move {
                Self::flush_when_quiet(pending, sink, group_id).await;
            });
        }
    }

    async fn flush_when_quiet(
        pending: Arc<DashMap<String, PendingGroup>>,
        sink: Arc<Sink>,
        group_id: String,
    ) {
        loop {
            let deadline = match pending.get(&group_id) {
                Some(entry) => entry.deadline,
                None => return,
            };

            if Instant::now() < deadline {
                tokio::time::sleep_until(deadline).await;
                continue;
            }

            // Window closed: take the group out and flush in one step.
            if let Some((_, group)) = pending.remove(&group_id) {
                tracing::debug!(
                    group_id = %group_id,
                    count = group.messages.len(),
                    "flushing media group"
                );
                sink(GroupBatch {
                    group_id,
                    user_id: group.user_id,
                    chat_id: group.chat_id,
                    messages: group.messages,
                })
                .await;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn message(msg_id: i64, grouped_id: &str) -> ChatMessage {
        ChatMessage {
            chat_id: 1,
            msg_id,
            sender_id: 7,
            text: String::new(),
            media: Some(crate::protocol::MediaInfo {
                file_name: format!("photo-{msg_id}.jpg"),
                file_size: 1024,
                mime_type: None,
            }),
            grouped_id: Some(grouped_id.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_group_flushes_once_with_all_messages() {
        let batches: Arc<Mutex<Vec<GroupBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_in = batches.clone();
        let aggregator = GroupAggregator::new(GroupAggregatorConfig::default(), move |batch| {
            let batches = batches_in.clone();
            async move {
                batches.lock().push(batch);
            }
        });

        aggregator.add("g1", 7, 1, message(10, "g1"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        aggregator.add("g1", 7, 1, message(11, "g1"));

        tokio::time::sleep(Duration::from_secs(3)).await;

        let flushed = batches.lock();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].messages.len(), 2);
        assert_eq!(flushed[0].group_id, "g1");
        assert_eq!(aggregator.pending_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_groups_flush_separately() {
        let batches: Arc<Mutex<Vec<GroupBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_in = batches.clone();
        let aggregator = GroupAggregator::new(GroupAggregatorConfig::default(), move |batch| {
            let batches = batches_in.clone();
            async move {
                batches.lock().push(batch);
            }
        });

        aggregator.add("g1", 7, 1, message(10, "g1"));
        aggregator.add("g2", 7, 1, message(20, "g2"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(batches.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_caps_the_sliding_window() {
        let batches: Arc<Mutex<Vec<GroupBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_in = batches.clone();
        let aggregator = GroupAggregator::new(GroupAggregatorConfig::default(), move |batch| {
            let batches = batches_in.clone();
            async move {
                batches.lock().push(batch);
            }
        });

        // Keep extending the window every second; the 5 s cap must still
        // flush the group.
        for i in 0..5 {
            aggregator.add("g1", 7, 1, message(i, "g1"));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let flushed = batches.lock();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].messages.len(), 5);
    }
}
