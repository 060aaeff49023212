//! Ingestion subsystem.
//!
//! Owns the queue definitions, the per-queue handler cache and the consumer
//! tasks. The API surface resolves handlers through [`IngestionSubsystem`]
//! and never constructs them itself.

mod consumer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::{Broker, BrokerConfig, Outbound};
use crate::cache::{CacheStore, mutex_lock};
use crate::domain::QueueDefinition;
use crate::handlers::{DropHandler, HandlerContext, HandlerRegistry, MessageHandler};

pub use consumer::{ConsumerState, QueueConsumer, receiving_queue_name};

pub(crate) const METRIC_MESSAGES: &str = "mqbridge_messages_total";
pub(crate) const METRIC_CONSUMER_RECONNECTS: &str = "mqbridge_consumer_reconnects_total";
pub(crate) const METRIC_DECODE_MS: &str = "mqbridge_message_decode_ms";

const SOURCE: &str = "ingest";
const FALLBACK_ID: &str = "ingest-fallback";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("queue `{queue}` names unknown handler `{handler}`")]
    UnknownHandler { queue: String, handler: String },
    #[error("queue `{queue}` declares write-operations but handler `{handler}` is unknown")]
    UnknownWriteHandler { queue: String, handler: String },
    #[error("queue id `{0}` is configured more than once")]
    DuplicateQueue(String),
}

/// Bounded linear backoff for consumer reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt.max(1))
    }
}

impl From<&BrokerConfig> for ReconnectPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            delay: config.reconnect_delay,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Treat an unknown handler name as fatal even without write-operations.
    pub strict_handlers: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            strict_handlers: false,
            reconnect: ReconnectPolicy::from(&BrokerConfig::default()),
        }
    }
}

/// A started consumer. Dropping it leaves the task running.
pub struct ConsumerHandle {
    pub queue_id: String,
    pub state: watch::Receiver<ConsumerState>,
    pub task: JoinHandle<()>,
}

pub struct IngestionSubsystem {
    queues: Vec<QueueDefinition>,
    store: Arc<dyn CacheStore>,
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    fallback: Arc<dyn MessageHandler>,
    options: IngestOptions,
}

impl IngestionSubsystem {
    pub fn new(
        queues: Vec<QueueDefinition>,
        store: Arc<dyn CacheStore>,
        broker: Arc<dyn Broker>,
        options: IngestOptions,
    ) -> Self {
        Self {
            queues,
            store,
            broker,
            registry: HandlerRegistry::builtin(),
            handlers: Mutex::new(HashMap::new()),
            fallback: Arc::new(DropHandler::new(FALLBACK_ID)),
            options,
        }
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn queue(&self, id: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|queue| queue.id == id)
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Check every queue's handler name before anything is started.
    pub fn validate(&self) -> Result<(), IngestError> {
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            if !seen.insert(queue.id.as_str()) {
                return Err(IngestError::DuplicateQueue(queue.id.clone()));
            }
            if self.registry.lookup(&queue.handler).is_some() {
                continue;
            }
            if queue.declares_write_operations() {
                return Err(IngestError::UnknownWriteHandler {
                    queue: queue.id.clone(),
                    handler: queue.handler.clone(),
                });
            }
            if self.options.strict_handlers {
                return Err(IngestError::UnknownHandler {
                    queue: queue.id.clone(),
                    handler: queue.handler.clone(),
                });
            }
        }
        Ok(())
    }

    /// Handler for `queue_id`, built on first use and cached for the process lifetime.
    ///
    /// Unknown handler names and unknown queue ids resolve to the shared drop
    /// handler; that fallback is cached too.
    pub fn resolve_handler(&self, queue_id: &str) -> Arc<dyn MessageHandler> {
        let mut handlers = mutex_lock(&self.handlers, SOURCE, "resolve_handler");
        if let Some(handler) = handlers.get(queue_id) {
            return handler.clone();
        }

        let handler = match self.queue(queue_id) {
            Some(queue) => match self.registry.lookup(&queue.handler) {
                Some(kind) => self.registry.instantiate(kind, self.context_for(queue)),
                None => {
                    error!(
                        queue = %queue_id,
                        handler = %queue.handler,
                        known = ?self.registry.names().collect::<Vec<_>>(),
                        "Unknown handler; falling back to drop"
                    );
                    self.fallback.clone()
                }
            },
            None => {
                error!(
                    queue = %queue_id,
                    "Handler requested for unconfigured queue; falling back to drop"
                );
                self.fallback.clone()
            }
        };

        handlers.insert(queue_id.to_string(), handler.clone());
        handler
    }

    /// Resolve every configured queue's handler up front.
    pub fn resolve_all(&self) {
        for queue in &self.queues {
            let handler = self.resolve_handler(&queue.id);
            info!(queue = %queue.id, handler = %handler.kind(), "Handler resolved");
        }
    }

    fn context_for(&self, queue: &QueueDefinition) -> HandlerContext {
        HandlerContext {
            queue_id: queue.id.clone(),
            store: self.store.clone(),
            outbound: Outbound::new(
                self.broker.clone(),
                queue.broker_url.clone(),
                queue.binding.clone(),
            ),
        }
    }

    /// Spawn one consumer task per configured queue.
    pub fn start(&self) -> Vec<ConsumerHandle> {
        self.queues
            .iter()
            .map(|queue| {
                let consumer = QueueConsumer::new(
                    queue.clone(),
                    self.resolve_handler(&queue.id),
                    self.broker.clone(),
                    self.options.reconnect,
                );
                let state = consumer.subscribe();
                ConsumerHandle {
                    queue_id: queue.id.clone(),
                    state,
                    task: tokio::spawn(consumer.run()),
                }
            })
            .collect()
    }
}
