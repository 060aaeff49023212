use async_trait::async_trait;
use tracing::debug;

use super::{DecodeError, HandlerKind, MessageHandler};

/// Acknowledges and discards every payload.
pub struct DropHandler {
    queue_id: String,
}

impl DropHandler {
    pub fn new(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for DropHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Drop
    }

    async fn consume(&self, payload: &[u8]) -> Result<usize, DecodeError> {
        debug!(queue = %self.queue_id, bytes = payload.len(), "Message discarded");
        Ok(0)
    }
}
