//! In-process broker.
//!
//! Routing follows the subset of AMQP the bridge relies on: a binding
//! matches when its exchange equals the published exchange and its routing
//! key is empty, `#`, or equal to the published key. Publishing to the
//! default exchange with a queue's name as routing key reaches that queue
//! directly.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::mutex_lock;
use crate::domain::BrokerBinding;

use super::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream};

const SOURCE: &str = "broker::memory";

/// A message as seen by the broker, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

struct QueueSlot {
    owner: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

impl Binding {
    fn matches(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange == exchange
            && (self.routing_key.is_empty()
                || self.routing_key == "#"
                || self.routing_key == routing_key)
    }
}

struct State {
    available: bool,
    /// Bumped by `sever`; channels opened before it refuse to publish.
    generation: u64,
    next_channel: u64,
    queues: HashMap<String, QueueSlot>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    next_tag: Arc<AtomicU64>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: true,
                generation: 0,
                next_channel: 0,
                queues: HashMap::new(),
                bindings: Vec::new(),
                published: Vec::new(),
                acked: Vec::new(),
            })),
            next_tag: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Route `payload` to every matching queue; returns how many received it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> usize {
        let payload = payload.into();
        let mut state = mutex_lock(&self.state, SOURCE, "publish");

        let mut targets: BTreeSet<String> = state
            .bindings
            .iter()
            .filter(|binding| binding.matches(exchange, routing_key))
            .map(|binding| binding.queue.clone())
            .collect();
        if exchange.is_empty() && state.queues.contains_key(routing_key) {
            targets.insert(routing_key.to_string());
        }

        let mut delivered = 0;
        for name in &targets {
            if let Some(slot) = state.queues.get(name) {
                let delivery = Delivery {
                    payload: payload.clone(),
                    tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
                };
                if slot.sender.send(delivery).is_ok() {
                    delivered += 1;
                }
            }
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
        debug!(exchange, routing_key, delivered, "Message routed");
        delivered
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        mutex_lock(&self.state, SOURCE, "published").published.clone()
    }

    /// Delivery tags acknowledged so far.
    pub fn acked(&self) -> Vec<u64> {
        mutex_lock(&self.state, SOURCE, "acked").acked.clone()
    }

    /// Number of queues currently bound to `exchange`.
    pub fn bound_queues(&self, exchange: &str) -> usize {
        mutex_lock(&self.state, SOURCE, "bound_queues")
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .map(|binding| binding.queue.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Drop every queue and binding, ending all open delivery streams and
    /// breaking every channel opened so far.
    pub fn sever(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "sever");
        state.queues.clear();
        state.bindings.clear();
        state.generation += 1;
    }

    /// Make later `open_channel` calls fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        mutex_lock(&self.state, SOURCE, "set_available").available = available;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn open_channel(
        &self,
        _url: Option<&str>,
    ) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = mutex_lock(&self.state, SOURCE, "open_channel");
        if !state.available {
            return Err(BrokerError::Connection("memory broker unavailable".to_string()));
        }
        state.next_channel += 1;
        Ok(Box::new(MemoryChannel {
            id: state.next_channel,
            generation: state.generation,
            broker: self.clone(),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    generation: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn state(&self, op: &'static str) -> std::sync::MutexGuard<'_, State> {
        mutex_lock(&self.broker.state, SOURCE, op)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exclusive_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state("declare");
        if state.queues.contains_key(name) {
            return Err(BrokerError::operation(
                "queue.declare",
                format!("queue `{name}` is exclusive to another channel"),
            ));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.insert(
            name.to_string(),
            QueueSlot {
                owner: self.id,
                sender,
                receiver: Some(receiver),
            },
        );
        Ok(())
    }

    async fn bind(&self, queue: &str, binding: &BrokerBinding) -> Result<(), BrokerError> {
        let mut state = self.state("bind");
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        state.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let receiver = self
            .state("consume")
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
            .receiver
            .take()
            .ok_or_else(|| {
                BrokerError::operation("basic.consume", "queue already has a consumer")
            })?;

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.state("ack").acked.push(delivery.tag);
        Ok(())
    }

    async fn publish(&self, binding: &BrokerBinding, payload: Bytes) -> Result<(), BrokerError> {
        if self.state("publish").generation != self.generation {
            return Err(BrokerError::operation("basic.publish", "channel closed"));
        }
        self.broker
            .publish(&binding.exchange, &binding.routing_key, payload);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut state = self.state("drop");
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, slot)| slot.owner == self.id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.queues.remove(name);
        }
        state.bindings.retain(|binding| !owned.contains(&binding.queue));
    }
}
