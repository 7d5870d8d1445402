//! Build-progress event bus.
//!
//! One topic per version, broadcast-to-all-subscribers semantics: every
//! subscriber attached to a topic sees every message published after it
//! subscribed, in publish order. A point-to-point channel would make
//! concurrent browser tabs compete for messages, so the bus is either NATS
//! core pub/sub or, when no bus is configured, an in-process broadcast
//! topic registry with the same semantics.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Capacity of each in-memory topic. A lagging subscriber past this many
/// undelivered messages starts losing the oldest ones.
const MEMORY_TOPIC_CAPACITY: usize = 256;

/// One row of the progress stream. Transient; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub version_id: String,
    pub status: ProgressStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Connected,
    Building,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

impl ProgressEvent {
    pub fn now(version_id: &str, status: ProgressStatus, message: &str) -> Self {
        Self {
            version_id: version_id.to_string(),
            status,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Topic carrying one version's progress events.
pub fn progress_topic(version_id: &str) -> String {
    format!("build:progress:{}", version_id)
}

/// Topic-based pub/sub with broadcast fan-out and FIFO delivery per topic.
pub enum EventBus {
    Nats(NatsBus),
    Memory(MemoryBus),
}

impl EventBus {
    /// Connect to NATS when a URL is configured; otherwise fall back to the
    /// in-process registry.
    pub async fn connect(nats_url: Option<&str>) -> Result<Self> {
        match nats_url {
            Some(url) => Ok(EventBus::Nats(NatsBus::connect(url).await?)),
            None => {
                warn!("NATS_URL not set; using in-process event bus (single-instance only)");
                Ok(EventBus::Memory(MemoryBus::new()))
            }
        }
    }

    pub fn in_memory() -> Self {
        EventBus::Memory(MemoryBus::new())
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        match self {
            EventBus::Nats(bus) => bus.publish(topic, payload).await,
            EventBus::Memory(bus) => bus.publish(topic, payload).await,
        }
    }

    /// Subscribe to a topic. The subscription is confirmed before this
    /// returns, so messages published afterwards are guaranteed delivery.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        match self {
            EventBus::Nats(bus) => bus.subscribe(topic).await,
            EventBus::Memory(bus) => Ok(bus.subscribe(topic).await),
        }
    }
}

pub struct Subscription {
    inner: SubscriptionInner,
}

enum SubscriptionInner {
    Nats(async_nats::Subscriber),
    Memory(broadcast::Receiver<Vec<u8>>),
}

impl Subscription {
    /// Next message payload, or `None` once the topic is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        match &mut self.inner {
            SubscriptionInner::Nats(sub) => sub.next().await.map(|msg| msg.payload.to_vec()),
            SubscriptionInner::Memory(rx) => loop {
                match rx.recv().await {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagged, skipped {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("🔄 Connecting to NATS server at: {}", url);
        let client = timeout(Duration::from_secs(5), async_nats::connect(url)).await??;
        info!("✅ Connected to NATS server successfully");
        Ok(Self { client })
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload.into())
            .await?;
        debug!("📤 Published to NATS topic {}", topic);
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let subscriber = self.client.subscribe(topic.to_string()).await?;
        // Flush so the SUB is on the server before the caller proceeds;
        // anything published after this point will be delivered.
        self.client.flush().await?;
        Ok(Subscription {
            inner: SubscriptionInner::Nats(subscriber),
        })
    }
}

/// In-process broadcast topic registry.
#[derive(Clone)]
pub struct MemoryBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        if let Some(tx) = self.topics.read().await.get(topic) {
            return tx.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
            .clone()
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // A send with no receivers is fine: pub/sub drops messages nobody
        // is listening for.
        let _ = self.sender(topic).await.send(payload);
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let rx = self.sender(topic).await.subscribe();
        Subscription {
            inner: SubscriptionInner::Memory(rx),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}
