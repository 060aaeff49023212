//! Discrete `{type, value}` commands.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    DecodeError, HandlerContext, HandlerError, HandlerKind, MessageHandler, OperationArgs,
    OperationSpec, key_segment,
};

/// Toggles an actuator by publishing `{type: "active", value}`.
pub const SET_ACTIVE_STATE: &str = "set_active_state";
const ACTIVE_ARG: &str = "active";
const ACTIVE_TYPE: &str = "active";

pub struct CommandHandler {
    context: HandlerContext,
}

impl CommandHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for CommandHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Command
    }

    async fn consume(&self, payload: &[u8]) -> Result<usize, DecodeError> {
        let message: Value = serde_json::from_slice(payload)?;
        let (Some(kind), Some(value)) = (message.get("type"), message.get("value")) else {
            debug!(queue = %self.context.queue_id, "Command without type/value ignored");
            return Ok(0);
        };

        let entry = key_segment(kind);
        self.context
            .store
            .write(&self.context.queue_id, &entry, json!({ "value": value }))
            .await;
        Ok(1)
    }

    fn operations(&self) -> &'static [OperationSpec] {
        &[OperationSpec {
            name: SET_ACTIVE_STATE,
            args: &[ACTIVE_ARG],
        }]
    }

    async fn invoke(&self, operation: &str, args: &OperationArgs) -> Result<(), HandlerError> {
        if operation != SET_ACTIVE_STATE {
            return Err(HandlerError::UnknownOperation {
                handler: self.kind().name(),
                operation: operation.to_string(),
            });
        }
        let active = args
            .get(ACTIVE_ARG)
            .ok_or_else(|| HandlerError::InvalidArgument {
                name: ACTIVE_ARG.to_string(),
                reason: "missing".to_string(),
            })?;

        self.context
            .outbound
            .publish_json(&json!({ "type": ACTIVE_TYPE, "value": active }))
            .await?;
        info!(queue = %self.context.queue_id, active = %active, "Active state published");
        Ok(())
    }
}
