//! Cache record shape shared by every store backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Value stored under a `(category, entry)` key.
///
/// Serialized as `{"entry": <value>, "meta": {"time": <RFC 3339>}}`. The
/// `meta` field is only present when the stored value is a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub entry: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl CacheRecord {
    /// Wrap a value, stamping it with `written_at` when it is structured.
    pub fn stamped(entry: Value, written_at: OffsetDateTime) -> Self {
        let meta = entry
            .is_object()
            .then_some(RecordMeta { time: written_at });
        Self { entry, meta }
    }

    pub fn now(entry: Value) -> Self {
        Self::stamped(entry, OffsetDateTime::now_utc())
    }

    pub fn written_at(&self) -> Option<OffsetDateTime> {
        self.meta.as_ref().map(|meta| meta.time)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn structured_values_carry_metadata() {
        let record = CacheRecord::stamped(json!({"value": 23}), datetime!(2024-05-01 12:00 UTC));
        assert_eq!(record.written_at(), Some(datetime!(2024-05-01 12:00 UTC)));

        let encoded = serde_json::to_value(&record).expect("serializable record");
        assert_eq!(encoded["entry"], json!({"value": 23}));
        assert_eq!(encoded["meta"]["time"], json!("2024-05-01T12:00:00Z"));
    }

    #[test]
    fn scalar_values_never_carry_metadata() {
        let record = CacheRecord::now(json!(42));
        assert!(record.meta.is_none());

        let encoded = serde_json::to_value(&record).expect("serializable record");
        assert_eq!(encoded, json!({"entry": 42}));
    }

    #[test]
    fn decodes_stored_json() {
        let raw = r#"{"entry":{"value":true},"meta":{"time":"2024-05-01T12:00:00+02:00"}}"#;
        let record: CacheRecord = serde_json::from_str(raw).expect("decodable record");
        assert_eq!(record.entry, json!({"value": true}));
        assert!(record.written_at().is_some());
    }
}
