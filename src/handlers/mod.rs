//! Per-queue message handlers.
//!
//! A handler turns raw broker payloads into cache writes under its queue id
//! and may expose named write-operations the HTTP surface can invoke.

mod command;
mod discard;
mod registry;
mod senml;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::broker::{BrokerError, Outbound};
use crate::cache::CacheStore;

pub use command::{CommandHandler, SET_ACTIVE_STATE};
pub use discard::DropHandler;
pub use registry::{HandlerKind, HandlerRegistry};
pub use senml::SenMlHandler;

/// Arguments passed to a write-operation, keyed by declared name.
pub type OperationArgs = Map<String, Value>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload shape: {0}")]
    Shape(&'static str),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler `{handler}` has no operation `{operation}`")]
    UnknownOperation {
        handler: &'static str,
        operation: String,
    },
    #[error("argument `{name}` is invalid: {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("publishing to the broker failed: {0}")]
    Publish(#[from] BrokerError),
}

/// A write-operation and the argument names it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSpec {
    pub name: &'static str,
    pub args: &'static [&'static str],
}

/// What a handler is constructed with.
pub struct HandlerContext {
    pub queue_id: String,
    pub store: Arc<dyn CacheStore>,
    pub outbound: Outbound,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Decode one payload and write its records; returns how many were written.
    async fn consume(&self, payload: &[u8]) -> Result<usize, DecodeError>;

    /// Write-operations this handler exposes.
    fn operations(&self) -> &'static [OperationSpec] {
        &[]
    }

    fn operation(&self, name: &str) -> Option<&'static OperationSpec> {
        self.operations().iter().find(|operation| operation.name == name)
    }

    fn supports(&self, operation: &str) -> bool {
        self.operation(operation).is_some()
    }

    async fn invoke(&self, operation: &str, _args: &OperationArgs) -> Result<(), HandlerError> {
        Err(HandlerError::UnknownOperation {
            handler: self.kind().name(),
            operation: operation.to_string(),
        })
    }
}

/// Render a JSON scalar as a key segment; strings are used verbatim.
pub(crate) fn key_segment(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
