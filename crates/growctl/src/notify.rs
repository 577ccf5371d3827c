//! Operator notifications. Texts are queued on a bounded drop-oldest queue
//! and published to an MQTT topic by a dedicated task; with MQTT disabled
//! they are only logged.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::events::BoundedQueue;

pub const NOTIFY_QUEUE_CAPACITY: usize = 256;

/// Cloneable fire-and-forget handle for outbound notifications.
#[derive(Clone)]
pub struct Notifier {
    queue: Arc<BoundedQueue<String>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(NOTIFY_QUEUE_CAPACITY)),
        }
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, text: impl Into<String>) {
        let text = text.into();
        debug!(%text, "notification queued");
        if !self.queue.push(text) && !self.queue.is_closed() {
            warn!(
                dropped = self.queue.dropped(),
                "notification queue full, dropped oldest"
            );
        }
    }

    pub fn close(&self) {
        self.queue.close();
    }

    #[cfg(test)]
    pub fn pending(&self) -> Vec<String> {
        self.queue.drain(usize::MAX)
    }

    /// Publish queued texts until closed. `client == None` logs instead.
    pub async fn run_publisher(self, client: Option<AsyncClient>, topic: String) {
        loop {
            self.queue.wait().await;
            let batch = self.queue.drain(NOTIFY_QUEUE_CAPACITY);
            if batch.is_empty() && self.queue.is_closed() {
                break;
            }
            for text in batch {
                match &client {
                    Some(client) => {
                        if let Err(e) = client
                            .publish(topic.as_str(), QoS::AtLeastOnce, false, text.into_bytes())
                            .await
                        {
                            warn!(%topic, "notification publish failed: {e}");
                        }
                    }
                    None => info!(target: "growctl::notify", "{text}"),
                }
            }
        }
        debug!("notification publisher stopped");
    }
}

// ---------------------------------------------------------------------------
// MQTT connection
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(options, 20)
}

/// Keep the MQTT connection alive. rumqttc reconnects on the next poll after
/// an error, so this only logs and backs off.
pub async fn drive_event_loop(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt connected"),
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
