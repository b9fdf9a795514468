//! The value serialization registry.
//!
//! Persistence backends store values as `(type id, bytes)` pairs and know
//! nothing about their shape. The registry is the single boundary through
//! which values cross into and out of storage: `serialize` finds a codec
//! accepting the value, `deserialize` dispatches on the recorded type id.
//!
//! A record whose type id is unknown, or whose payload fails to decode, is
//! a data error for that one record: callers skip it and log, they do not
//! abort the load.

use crate::{Error, Result, Value};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Encodes and decodes one family of values.
///
/// Implementations are registered with a [`TypeRegistry`]; the `type_id`
/// travels with every persisted record and selects the codec on the way
/// back in.
pub trait ValueCodec: Send + Sync {
    /// The identifier stored alongside payloads produced by this codec.
    fn type_id(&self) -> &'static str;

    /// Whether this codec can encode the given value.
    fn accepts(&self, value: &Value) -> bool;

    /// Encodes a value this codec accepts.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decodes a payload previously produced by [`encode`](Self::encode).
    fn decode(&self, data: &[u8]) -> Result<Value>;
}

/// Registry of [`ValueCodec`]s, looked up by type id on load and by value
/// shape on save.
pub struct TypeRegistry {
    ordered: Vec<Arc<dyn ValueCodec>>,
    by_id: HashMap<&'static str, Arc<dyn ValueCodec>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { ordered: Vec::new(), by_id: HashMap::new() }
    }

    /// Creates a registry with codecs for every built-in value type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BooleanCodec));
        registry.register(Arc::new(LongCodec));
        registry.register(Arc::new(DoubleCodec));
        registry.register(Arc::new(TextCodec));
        registry.register(Arc::new(BytesCodec));
        registry
    }

    /// Registers a codec. A codec registered later wins id collisions.
    pub fn register(&mut self, codec: Arc<dyn ValueCodec>) {
        self.by_id.insert(codec.type_id(), Arc::clone(&codec));
        self.ordered.push(codec);
    }

    /// Serializes a value, returning the codec's type id and the payload.
    pub fn serialize(&self, value: &Value) -> Result<(&'static str, Bytes)> {
        for codec in &self.ordered {
            if codec.accepts(value) {
                return Ok((codec.type_id(), Bytes::from(codec.encode(value)?)));
            }
        }
        Err(Error::serialization(format!("no codec accepts value {:?}", value)))
    }

    /// Deserializes a payload by its recorded type id.
    pub fn deserialize(&self, type_id: &str, data: &[u8]) -> Result<Value> {
        let codec = self
            .by_id
            .get(type_id)
            .ok_or_else(|| Error::unknown_type(format!("no codec registered for '{}'", type_id)))?;
        codec.decode(data)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

macro_rules! primitive_codec {
    ($name:ident, $id:literal, $variant:ident, $ty:ty) => {
        /// Codec for the corresponding built-in value type.
        struct $name;

        impl ValueCodec for $name {
            fn type_id(&self) -> &'static str {
                $id
            }

            fn accepts(&self, value: &Value) -> bool {
                matches!(value, Value::$variant(_))
            }

            fn encode(&self, value: &Value) -> Result<Vec<u8>> {
                match value {
                    Value::$variant(inner) => Ok(bincode::serialize(inner)?),
                    other => Err(Error::serialization(format!(
                        "codec '{}' cannot encode {:?}",
                        $id, other
                    ))),
                }
            }

            fn decode(&self, data: &[u8]) -> Result<Value> {
                let inner: $ty = bincode::deserialize(data)?;
                Ok(Value::$variant(inner))
            }
        }
    };
}

primitive_codec!(BooleanCodec, "boolean", Boolean, bool);
primitive_codec!(LongCodec, "long", Long, i64);
primitive_codec!(DoubleCodec, "double", Double, f64);
primitive_codec!(TextCodec, "string", Text, String);
primitive_codec!(BytesCodec, "bytes", Bytes, Vec<u8>);
