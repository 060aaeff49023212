//! One long-running consumer per configured queue.
//!
//! ```text
//! Connecting -> Bound -> Consuming -> Disconnected -> Connecting ...
//! ```
//!
//! A consumer gives up after `max_attempts` consecutive sessions that end
//! without reaching `Bound` again.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, Delivery};
use crate::domain::QueueDefinition;
use crate::handlers::MessageHandler;

use super::{METRIC_CONSUMER_RECONNECTS, METRIC_DECODE_MS, METRIC_MESSAGES, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Bound,
    Consuming,
    Disconnected,
}

impl ConsumerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Bound => "bound",
            Self::Consuming => "consuming",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the exclusive receiving queue for one consumer session.
pub fn receiving_queue_name(queue_id: &str) -> String {
    format!("mqbridge-{queue_id}-{}", Uuid::new_v4().simple())
}

pub struct QueueConsumer {
    queue: QueueDefinition,
    handler: Arc<dyn MessageHandler>,
    broker: Arc<dyn Broker>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConsumerState>,
}

impl QueueConsumer {
    pub fn new(
        queue: QueueDefinition,
        handler: Arc<dyn MessageHandler>,
        broker: Arc<dyn Broker>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Connecting);
        Self {
            queue,
            handler,
            broker,
            policy,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        debug!(queue = %self.queue.id, state = %next, "Consumer state changed");
        self.state.send_replace(next);
    }

    /// Consume until reconnect attempts are exhausted.
    pub async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            self.transition(ConsumerState::Connecting);
            match self.session(&mut failures).await {
                Ok(()) => info!(queue = %self.queue.id, "Delivery stream ended"),
                Err(err) => warn!(queue = %self.queue.id, error = %err, "Consumer session failed"),
            }
            self.transition(ConsumerState::Disconnected);

            failures += 1;
            if failures > self.policy.max_attempts {
                error!(
                    queue = %self.queue.id,
                    attempts = failures - 1,
                    "Consumer stopped after exhausting reconnect attempts"
                );
                return;
            }

            let delay = self.policy.delay_for(failures);
            counter!(METRIC_CONSUMER_RECONNECTS, "queue" => self.queue.id.clone()).increment(1);
            info!(
                queue = %self.queue.id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting consumer"
            );
            sleep(delay).await;
        }
    }

    async fn session(&self, failures: &mut u32) -> Result<(), BrokerError> {
        let channel = self
            .broker
            .open_channel(self.queue.broker_url.as_deref())
            .await?;
        let receiving = receiving_queue_name(&self.queue.id);
        channel.declare_exclusive_queue(&receiving).await?;
        channel.bind(&receiving, &self.queue.binding).await?;
        *failures = 0;
        self.transition(ConsumerState::Bound);
        info!(
            queue = %self.queue.id,
            receiving = %receiving,
            exchange = %self.queue.binding.exchange,
            routing_key = %self.queue.binding.routing_key,
            handler = %self.handler.kind(),
            "Consumer bound"
        );

        let mut deliveries = channel.consume(&receiving).await?;
        self.transition(ConsumerState::Consuming);

        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;
            if let Err(err) = channel.ack(&delivery).await {
                warn!(queue = %self.queue.id, tag = delivery.tag, error = %err, "Ack failed");
            }
            self.dispatch(&delivery).await;
        }
        Ok(())
    }

    async fn dispatch(&self, delivery: &Delivery) {
        let started = Instant::now();
        let result = self.handler.consume(&delivery.payload).await;
        histogram!(METRIC_DECODE_MS, "queue" => self.queue.id.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let outcome = match result {
            Ok(0) => "ignored",
            Ok(_) => "stored",
            Err(err) => {
                warn!(
                    queue = %self.queue.id,
                    tag = delivery.tag,
                    error = %err,
                    "Message could not be decoded"
                );
                "failed"
            }
        };
        counter!(METRIC_MESSAGES, "queue" => self.queue.id.clone(), "outcome" => outcome)
            .increment(1);
    }
}
