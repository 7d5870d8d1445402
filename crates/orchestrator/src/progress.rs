//! Progress publication.

use events::{EventBus, ProgressEvent, ProgressStatus, progress_topic};
use std::sync::Arc;
use tracing::{debug, error};

/// Serializes progress events and publishes them on the version's topic.
/// Publication failures are logged and swallowed: losing a progress frame
/// must never fail a build.
#[derive(Clone)]
pub struct ProgressPublisher {
    bus: Arc<EventBus>,
}

impl ProgressPublisher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, version_id: &str, status: ProgressStatus, message: &str) {
        let event = ProgressEvent::now(version_id, status, message);

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize progress event: {}", e);
                return;
            }
        };

        let topic = progress_topic(version_id);
        if let Err(e) = self.bus.publish(&topic, payload).await {
            error!("Failed to publish progress to {}: {}", topic, e);
        } else {
            debug!("Progress [{}] {:?}: {}", version_id, status, message);
        }
    }
}
