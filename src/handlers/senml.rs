//! SenML (RFC 8428) measurement packs.
//!
//! A pack is a JSON array of records. `bn` sets the base name for the record
//! that declares it and every later record in the same pack; a record with
//! `n` is stored under `{bn}{n}` with the declared base re-attached as is.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{DecodeError, HandlerContext, HandlerKind, MessageHandler, key_segment};

const BASE_NAME: &str = "bn";
const NAME: &str = "n";

pub struct SenMlHandler {
    context: HandlerContext,
}

impl SenMlHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for SenMlHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::SenMl
    }

    async fn consume(&self, payload: &[u8]) -> Result<usize, DecodeError> {
        let Value::Array(records) = serde_json::from_slice(payload)? else {
            return Err(DecodeError::Shape("expected a JSON array of SenML records"));
        };

        let mut base: Option<Value> = None;
        let mut written = 0;
        for record in records {
            let Value::Object(mut fields) = record else {
                continue;
            };
            if let Some(declared) = fields.remove(BASE_NAME) {
                base = Some(declared);
            }
            let Some(name) = fields.get(NAME).map(key_segment) else {
                continue;
            };

            let prefix = base.as_ref().map(key_segment).unwrap_or_default();
            let entry = format!("{prefix}{name}");
            fields.insert(BASE_NAME.to_string(), base.clone().unwrap_or(Value::Null));
            self.context
                .store
                .write(&self.context.queue_id, &entry, Value::Object(fields))
                .await;
            written += 1;
        }

        debug!(queue = %self.context.queue_id, written, "SenML pack decoded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::CacheStore;
    use crate::handlers::testing::fixture;

    #[tokio::test]
    async fn base_name_carries_across_records() {
        let fx = fixture("env");
        let handler = SenMlHandler::new(fx.context);

        let pack = br#"[{"bn": "room1/", "n": "temp", "v": 21}, {"n": "humidity", "v": 40}]"#;
        assert_eq!(handler.consume(pack).await.expect("decoded"), 2);
        fx.store.flush().await.expect("flush");

        let temp = fx.store.read("env", "room1/temp").await.expect("temp");
        assert_eq!(temp.entry, json!({"n": "temp", "v": 21, "bn": "room1/"}));
        let humidity = fx.store.read("env", "room1/humidity").await.expect("humidity");
        assert_eq!(humidity.entry["bn"], json!("room1/"));
        assert_eq!(humidity.entry["v"], json!(40));
    }

    #[tokio::test]
    async fn non_string_base_is_reattached_unchanged() {
        let fx = fixture("env");
        let handler = SenMlHandler::new(fx.context);

        let pack = br#"[{"bn": 5, "n": "temp", "v": 21}]"#;
        assert_eq!(handler.consume(pack).await.expect("decoded"), 1);
        fx.store.flush().await.expect("flush");

        let temp = fx.store.read("env", "5temp").await.expect("temp");
        assert_eq!(temp.entry["bn"], json!(5));
    }

    #[tokio::test]
    async fn base_name_resets_between_packs() {
        let fx = fixture("env");
        let handler = SenMlHandler::new(fx.context);

        handler
            .consume(br#"[{"bn": "room1/", "n": "temp", "v": 21}]"#)
            .await
            .expect("first");
        handler
            .consume(br#"[{"n": "temp", "v": 19}]"#)
            .await
            .expect("second");
        fx.store.flush().await.expect("flush");

        let bare = fx.store.read("env", "temp").await.expect("bare");
        assert_eq!(bare.entry["bn"], Value::Null);
        assert_eq!(bare.entry["v"], json!(19));
    }

    #[tokio::test]
    async fn base_only_records_update_base_without_writing() {
        let fx = fixture("env");
        let handler = SenMlHandler::new(fx.context);

        let pack = br#"[{"bn": "a/"}, {"v": 1}, 5, {"bn": "b/", "n": "x", "v": 2}]"#;
        assert_eq!(handler.consume(pack).await.expect("decoded"), 1);
        fx.store.flush().await.expect("flush");

        let entries: Vec<String> = fx.store.entries("env").await.into_iter().collect();
        assert_eq!(entries, vec!["b/x"]);
    }

    #[tokio::test]
    async fn rejects_non_array_payloads() {
        let fx = fixture("env");
        let handler = SenMlHandler::new(fx.context);
        assert!(matches!(
            handler.consume(br#"{"n": "temp"}"#).await,
            Err(DecodeError::Shape(_))
        ));
    }
}
