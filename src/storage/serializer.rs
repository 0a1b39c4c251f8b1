//! Serializer registry for JSON-valued columns
//!
//! The channel row stores several semantically-typed JSON columns
//! (models, model_mapping, sets, config). Entities hold them as TEXT and
//! go through a codec looked up by name, so adding a new JSON column
//! needs no schema change. The default codec is registered as
//! `"fastjson"`.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use crate::utils::error::{GatewayError, Result};

pub const FASTJSON: &str = "fastjson";

pub trait JsonCodec: Send + Sync {
    fn encode(&self, value: &serde_json::Value) -> Result<String>;
    fn decode(&self, raw: &str) -> Result<serde_json::Value>;
}

struct FastJsonCodec;

impl JsonCodec for FastJsonCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<String> {
        serde_json::to_string(value).map_err(Into::into)
    }

    fn decode(&self, raw: &str) -> Result<serde_json::Value> {
        serde_json::from_str(raw).map_err(Into::into)
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn JsonCodec>>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn JsonCodec>> = HashMap::new();
    map.insert(FASTJSON.to_string(), Arc::new(FastJsonCodec));
    RwLock::new(map)
});

pub fn register(name: &str, codec: Arc<dyn JsonCodec>) {
    REGISTRY.write().insert(name.to_string(), codec);
}

fn codec(name: &str) -> Result<Arc<dyn JsonCodec>> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| GatewayError::Internal(format!("serializer not registered: {name}")))
}

/// Encode a typed value into its column text.
pub fn encode<T: Serialize>(serializer: &str, value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    codec(serializer)?.encode(&value)
}

/// Decode a column text into a typed value; empty text decodes to the
/// type's default, matching a never-written column.
pub fn decode<T: DeserializeOwned + Default>(serializer: &str, raw: &str) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    let value = codec(serializer)?.decode(raw)?;
    serde_json::from_value(value).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn fastjson_roundtrip() {
        let models = vec!["a".to_string(), "b".to_string()];
        let raw = encode(FASTJSON, &models).unwrap();
        let back: Vec<String> = decode(FASTJSON, &raw).unwrap();
        assert_eq!(back, models);
    }

    #[test]
    fn empty_column_decodes_to_default() {
        let mapping: Map<String, String> = decode(FASTJSON, "").unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn unknown_serializer_is_an_error() {
        let err = encode("no-such-codec", &1).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn custom_codecs_can_be_registered() {
        struct Upper;
        impl JsonCodec for Upper {
            fn encode(&self, value: &serde_json::Value) -> Result<String> {
                Ok(serde_json::to_string(value)?.to_uppercase())
            }
            fn decode(&self, raw: &str) -> Result<serde_json::Value> {
                Ok(serde_json::from_str(&raw.to_lowercase())?)
            }
        }
        register("upper", Arc::new(Upper));
        let raw = encode("upper", &"abc").unwrap();
        assert_eq!(raw, "\"ABC\"");
        let back: String = decode("upper", &raw).unwrap();
        assert_eq!(back, "abc");
    }
}
