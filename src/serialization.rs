//! # Payload Serialization
//!
//! Payloads travel through the journal as a [`Payload`]: a JSON value plus
//! the name of the type it was produced from. How a payload becomes bytes is
//! decided by a [`Serializer`], and serializers are looked up in a
//! [`SerializerRegistry`] that is built once and shared by the journal and
//! snapshot store.
//!
//! ## Dispatch
//!
//! ```text
//! write:  Payload ──► registry.serializer_for(type_name) ──► (id, manifest, bytes)
//!
//! read:   (id, manifest, bytes)
//!            │
//!            ├── id present ──► registry.serializer_by_id(id).from_binary(bytes, manifest)
//!            └── id missing ──► registry.serializer_for_manifest(manifest)   (legacy rows)
//! ```
//!
//! Serializers that carry a string manifest (see [`Serializer::manifest`])
//! can version their format: the manifest written next to the bytes is
//! handed back to `from_binary` on replay.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Payload
// =============================================================================

/// A logical event or snapshot payload.
///
/// `type_name` is the fully qualified Rust type the payload was built from.
/// Payloads read back from storage carry the stored manifest instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    type_name: String,
    value: Value,
}

impl Payload {
    /// Serializes `value` into a payload named after `T`.
    pub fn new<T: Serialize>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Serialization(format!("{}: {e}", type_name::<T>())))?;
        Ok(Self {
            type_name: type_name::<T>().to_string(),
            value,
        })
    }

    /// Builds a payload from an already-serialized value.
    pub fn from_value(type_name: impl Into<String>, value: Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Deserializes the payload into `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| Error::Serialization(format!("{} as {}: {e}", self.type_name, type_name::<T>())))
    }
}

// =============================================================================
// Serializer
// =============================================================================

/// Converts payloads to bytes and back.
///
/// Identifiers must be unique within a registry and stable across releases:
/// they are persisted next to every binary payload.
pub trait Serializer: Send + Sync {
    /// Stable identifier written to the `serializer_id` column.
    fn identifier(&self) -> i32;

    /// Format manifest for `payload`, if this serializer versions its output.
    fn manifest(&self, _payload: &Payload) -> Option<String> {
        None
    }

    fn to_binary(&self, payload: &Payload) -> Result<Vec<u8>>;

    fn from_binary(&self, bytes: &[u8], manifest: &str) -> Result<Payload>;
}

/// Identifier of [`JsonSerializer`].
pub const JSON_SERIALIZER_ID: i32 = 1;

/// Writes the payload value as compact JSON bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn identifier(&self) -> i32 {
        JSON_SERIALIZER_ID
    }

    fn to_binary(&self, payload: &Payload) -> Result<Vec<u8>> {
        serde_json::to_vec(payload.value()).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn from_binary(&self, bytes: &[u8], manifest: &str) -> Result<Payload> {
        let value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("payload '{manifest}': {e}")))?;
        Ok(Payload::from_value(manifest, value))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Serializers keyed by identifier, plus type-name bindings.
///
/// # Example
///
/// ```rust,ignore
/// let registry = SerializerRegistry::new()
///     .register(AccountSerializer)
///     .bind(std::any::type_name::<AccountOpened>(), ACCOUNT_SERIALIZER_ID);
/// ```
#[derive(Clone)]
pub struct SerializerRegistry {
    by_id: HashMap<i32, Arc<dyn Serializer>>,
    bindings: HashMap<String, i32>,
    default_id: i32,
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("SerializerRegistry")
            .field("serializers", &ids)
            .field("bindings", &self.bindings)
            .field("default_id", &self.default_id)
            .finish()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializerRegistry {
    /// A registry whose default serializer is [`JsonSerializer`].
    pub fn new() -> Self {
        let mut by_id: HashMap<i32, Arc<dyn Serializer>> = HashMap::new();
        by_id.insert(JSON_SERIALIZER_ID, Arc::new(JsonSerializer));
        Self {
            by_id,
            bindings: HashMap::new(),
            default_id: JSON_SERIALIZER_ID,
        }
    }

    /// Adds a serializer, replacing any with the same identifier.
    pub fn register(mut self, serializer: impl Serializer + 'static) -> Self {
        self.by_id.insert(serializer.identifier(), Arc::new(serializer));
        self
    }

    /// Routes payloads (and legacy rows) named `type_name` to serializer `id`.
    pub fn bind(mut self, type_name: impl Into<String>, id: i32) -> Self {
        self.bindings.insert(type_name.into(), id);
        self
    }

    /// Uses serializer `id` for payloads without a binding.
    pub fn with_default(mut self, id: i32) -> Self {
        self.default_id = id;
        self
    }

    /// Checks that every binding and the default point at registered serializers.
    pub fn validate(&self) -> Result<()> {
        if !self.by_id.contains_key(&self.default_id) {
            return Err(Error::Configuration(format!(
                "default serializer {} is not registered",
                self.default_id
            )));
        }
        for (type_name, id) in &self.bindings {
            if !self.by_id.contains_key(id) {
                return Err(Error::Configuration(format!(
                    "type '{type_name}' is bound to unregistered serializer {id}"
                )));
            }
        }
        Ok(())
    }

    /// Serializer used to write `payload`.
    pub fn serializer_for(&self, payload: &Payload) -> Result<&Arc<dyn Serializer>> {
        self.serializer_for_manifest(payload.type_name())
    }

    /// Serializer recorded on a stored row.
    pub fn serializer_by_id(&self, id: i32) -> Result<&Arc<dyn Serializer>> {
        self.by_id
            .get(&id)
            .ok_or_else(|| Error::Serialization(format!("unknown serializer id {id}")))
    }

    /// Serializer for a row written without an identifier.
    pub fn serializer_for_manifest(&self, manifest: &str) -> Result<&Arc<dyn Serializer>> {
        let id = self.bindings.get(manifest).copied().unwrap_or(self.default_id);
        self.serializer_by_id(id)
    }
}

// =============================================================================
// Tests
// =============================================================================
