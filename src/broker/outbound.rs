use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::BrokerBinding;

use super::{Broker, BrokerChannel, BrokerError};

/// Publisher owned by one handler instance.
///
/// The channel is opened on first publish and reused afterwards. A failed
/// publish discards the channel and retries once on a fresh one.
pub struct Outbound {
    broker: Arc<dyn Broker>,
    broker_url: Option<String>,
    binding: BrokerBinding,
    channel: Mutex<Option<Box<dyn BrokerChannel>>>,
}

impl Outbound {
    pub fn new(
        broker: Arc<dyn Broker>,
        broker_url: Option<String>,
        binding: BrokerBinding,
    ) -> Self {
        Self {
            broker,
            broker_url,
            binding,
            channel: Mutex::new(None),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    pub async fn publish_json(&self, message: &Value) -> Result<(), BrokerError> {
        let payload = Bytes::from(
            serde_json::to_vec(message).map_err(|err| BrokerError::operation("encode", err))?,
        );

        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            match channel.publish(&self.binding, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        exchange = %self.binding.exchange,
                        error = %err,
                        "Outbound publish failed; reopening channel"
                    );
                    *slot = None;
                }
            }
        }

        debug!(
            exchange = %self.binding.exchange,
            routing_key = %self.binding.routing_key,
            "Opening outbound channel"
        );
        let channel = self.broker.open_channel(self.broker_url.as_deref()).await?;
        channel.publish(&self.binding, payload).await?;
        *slot = Some(channel);
        Ok(())
    }
}
