//! # Payload Codecs
//!
//! A codec turns a [`Payload`] into the value bound to the `payload` column
//! and back. The codec is picked once from the configured [`StoredAs`] when the
//! journal or snapshot store is built, so no per-event branching on the
//! storage format happens afterwards.
//!
//! ```text
//! stored-as   codec          column value          serializer_id
//! ─────────   ────────────   ───────────────────   ─────────────
//! bytea       BinaryCodec    serializer bytes      serializer id
//! json        JsonCodec      JSON text             NULL
//! jsonb       JsonCodec      jsonb(JSON text)      NULL
//! ```
//!
//! JSON rows store the manifest as the payload's type name so replay can tell
//! payload types apart without a serializer.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;

use crate::error::{Error, Result};
use crate::serialization::{Payload, SerializerRegistry};
use crate::settings::StoredAs;

// =============================================================================
// Stored Values
// =============================================================================

/// The raw value of a `payload` column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoredPayload {
    Binary(Vec<u8>),
    Text(String),
}

impl StoredPayload {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            StoredPayload::Binary(bytes) => bytes,
            StoredPayload::Text(text) => text.into_bytes(),
        }
    }
}

impl ToSql for StoredPayload {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            StoredPayload::Binary(bytes) => ToSqlOutput::from(bytes.as_slice()),
            StoredPayload::Text(text) => ToSqlOutput::from(text.as_str()),
        })
    }
}

/// Reads a payload column regardless of its storage class.
pub(crate) fn read_payload(row: &Row<'_>, idx: usize) -> rusqlite::Result<StoredPayload> {
    match row.get_ref(idx)? {
        ValueRef::Blob(bytes) => Ok(StoredPayload::Binary(bytes.to_vec())),
        ValueRef::Text(text) => Ok(StoredPayload::Text(String::from_utf8_lossy(text).into_owned())),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "payload".to_string(),
            other.data_type(),
        )),
    }
}

/// A payload ready to be bound into an insert.
#[derive(Debug, Clone)]
pub(crate) struct EncodedPayload {
    pub manifest: String,
    pub serializer_id: Option<i32>,
    pub data: StoredPayload,
}

// =============================================================================
// Codec Trait
// =============================================================================

pub(crate) trait PayloadCodec: Send + Sync {
    /// Encodes `payload`. A non-empty `explicit_manifest` takes precedence over
    /// anything the serializer would write.
    fn encode(&self, payload: &Payload, explicit_manifest: &str) -> Result<EncodedPayload>;

    fn decode(
        &self,
        data: StoredPayload,
        manifest: &str,
        serializer_id: Option<i32>,
    ) -> Result<Payload>;
}

/// Resolves the codec for a storage format.
pub(crate) fn codec_for(
    stored_as: StoredAs,
    registry: Arc<SerializerRegistry>,
) -> Arc<dyn PayloadCodec> {
    match stored_as {
        StoredAs::ByteA => Arc::new(BinaryCodec { registry }),
        StoredAs::Json | StoredAs::JsonB => Arc::new(JsonCodec),
    }
}

// =============================================================================
// Binary (bytea)
// =============================================================================

struct BinaryCodec {
    registry: Arc<SerializerRegistry>,
}

impl PayloadCodec for BinaryCodec {
    fn encode(&self, payload: &Payload, explicit_manifest: &str) -> Result<EncodedPayload> {
        let serializer = self.registry.serializer_for(payload)?;
        let manifest = if !explicit_manifest.is_empty() {
            explicit_manifest.to_string()
        } else {
            serializer
                .manifest(payload)
                .unwrap_or_else(|| payload.type_name().to_string())
        };

        Ok(EncodedPayload {
            manifest,
            serializer_id: Some(serializer.identifier()),
            data: StoredPayload::Binary(serializer.to_binary(payload)?),
        })
    }

    fn decode(
        &self,
        data: StoredPayload,
        manifest: &str,
        serializer_id: Option<i32>,
    ) -> Result<Payload> {
        let serializer = match serializer_id {
            Some(id) => self.registry.serializer_by_id(id)?,
            None => self.registry.serializer_for_manifest(manifest)?,
        };
        serializer.from_binary(&data.into_bytes(), manifest)
    }
}

// =============================================================================
// JSON text and SQLite JSONB
// =============================================================================

/// Both JSON formats bind text; the SQL wrapper picks the column encoding.
struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Payload, explicit_manifest: &str) -> Result<EncodedPayload> {
        let manifest = if explicit_manifest.is_empty() {
            payload.type_name().to_string()
        } else {
            explicit_manifest.to_string()
        };
        let text = serde_json::to_string(payload.value())
            .map_err(|e| Error::Serialization(format!("payload '{manifest}': {e}")))?;

        Ok(EncodedPayload {
            manifest,
            serializer_id: None,
            data: StoredPayload::Text(text),
        })
    }

    fn decode(
        &self,
        data: StoredPayload,
        manifest: &str,
        _serializer_id: Option<i32>,
    ) -> Result<Payload> {
        let value = serde_json::from_slice(&data.into_bytes())
            .map_err(|e| Error::Serialization(format!("payload '{manifest}': {e}")))?;
        Ok(Payload::from_value(manifest, value))
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Milliseconds since the Unix epoch.
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{Serializer, JSON_SERIALIZER_ID};
    use serde_json::json;

    /// Writes "v2" payloads as `key=value` lines.
    struct KeyValue;

    impl Serializer for KeyValue {
        fn identifier(&self) -> i32 {
            42
        }

        fn manifest(&self, _payload: &Payload) -> Option<String> {
            Some("kv-v2".to_string())
        }

        fn to_binary(&self, payload: &Payload) -> Result<Vec<u8>> {
            let obj = payload
                .value()
                .as_object()
                .ok_or_else(|| Error::Serialization("expected object".to_string()))?;
            let lines: Vec<String> = obj.iter().map(|(k, v)| format!("{k}={v}")).collect();
            Ok(lines.join("\n").into_bytes())
        }

        fn from_binary(&self, bytes: &[u8], manifest: &str) -> Result<Payload> {
            if manifest != "kv-v2" {
                return Err(Error::Serialization(format!("unknown manifest {manifest}")));
            }
            let mut obj = serde_json::Map::new();
            for line in String::from_utf8_lossy(bytes).lines() {
                let (k, v) = line
                    .split_once('=')
                    .ok_or_else(|| Error::Serialization(line.to_string()))?;
                let v = serde_json::from_str(v).map_err(|e| Error::Serialization(e.to_string()))?;
                obj.insert(k.to_string(), v);
            }
            Ok(Payload::from_value(manifest, serde_json::Value::Object(obj)))
        }
    }

    fn registry() -> Arc<SerializerRegistry> {
        Arc::new(SerializerRegistry::new().register(KeyValue).bind("kv", 42))
    }

    #[test]
    fn test_binary_codec_uses_default_serializer() {
        let codec = codec_for(StoredAs::ByteA, registry());
        let payload = Payload::from_value("note", json!({"text": "hello"}));

        let encoded = codec.encode(&payload, "").unwrap();
        assert_eq!(encoded.manifest, "note");
        assert_eq!(encoded.serializer_id, Some(JSON_SERIALIZER_ID));

        let decoded = codec
            .decode(encoded.data, &encoded.manifest, encoded.serializer_id)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_binary_codec_serializer_manifest() {
        let codec = codec_for(StoredAs::ByteA, registry());
        let payload = Payload::from_value("kv", json!({"a": 1, "b": "x"}));

        let encoded = codec.encode(&payload, "").unwrap();
        assert_eq!(encoded.manifest, "kv-v2");
        assert_eq!(encoded.serializer_id, Some(42));

        let decoded = codec
            .decode(encoded.data, &encoded.manifest, encoded.serializer_id)
            .unwrap();
        assert_eq!(decoded.value(), payload.value());
    }

    #[test]
    fn test_explicit_manifest_wins() {
        let codec = codec_for(StoredAs::ByteA, registry());
        let payload = Payload::from_value("note", json!(1));

        let encoded = codec.encode(&payload, "note-v7").unwrap();
        assert_eq!(encoded.manifest, "note-v7");
    }

    #[test]
    fn test_binary_codec_legacy_row_without_serializer_id() {
        let codec = codec_for(StoredAs::ByteA, registry());

        let json_row = StoredPayload::Binary(br#"{"n":1}"#.to_vec());
        let decoded = codec.decode(json_row, "anything", None).unwrap();
        assert_eq!(decoded.value(), &json!({"n": 1}));

        // Manifest bound to the key-value serializer.
        let kv_row = StoredPayload::Binary(b"n=1".to_vec());
        let err = codec.decode(kv_row, "kv", None).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_binary_codec_unknown_serializer_id() {
        let codec = codec_for(StoredAs::ByteA, registry());
        let err = codec
            .decode(StoredPayload::Binary(vec![1, 2]), "x", Some(999))
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_json_codec() {
        for stored_as in [StoredAs::Json, StoredAs::JsonB] {
            let codec = codec_for(stored_as, registry());

            let payload = Payload::from_value("doc", json!({"nested": [1, 2, {"k": null}]}));
            let encoded = codec.encode(&payload, "").unwrap();
            assert_eq!(encoded.serializer_id, None);
            assert!(matches!(encoded.data, StoredPayload::Text(_)));

            let decoded = codec.decode(encoded.data, "doc", None).unwrap();
            assert_eq!(decoded, payload);

            let err = codec
                .decode(StoredPayload::Text("{oops".to_string()), "doc", None)
                .unwrap_err();
            assert!(matches!(err, Error::Serialization(_)));
        }
    }

    #[test]
    fn test_current_time_ms_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(current_time_ms() > 1_577_836_800_000);
    }
}
