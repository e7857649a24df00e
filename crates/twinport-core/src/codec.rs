//! Codec bridge between the binary RPC encoding and JSON.
//!
//! Messages are plain structs deriving both `prost::Message` (binary wire
//! form) and serde (JSON form). [`JsonCodec`] carries the marshaling options
//! the gateway applies; the binary side has no options.
//!
//! A message's default value doubles as its JSON schema: serializing
//! `M::default()` yields every declared field with its JSON kind, which is
//! what the unpopulated-field filter, the unknown-field check and the
//! query/path parameter coercion all work from.
//!
//! The JSON form is whatever serde derives. In particular 64-bit integers
//! are written as JSON numbers, not the quoted strings canonical protobuf
//! JSON uses; clients that need exact values above 2^53 must parse them as
//! such.

use crate::{Result, TwinportError};
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A message usable on both protocols.
pub trait RpcMessage: Message + Default + Serialize + DeserializeOwned + 'static {}

impl<T> RpcMessage for T where T: Message + Default + Serialize + DeserializeOwned + 'static {}

/// Encode a message to its binary wire form.
pub fn encode_binary<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

/// Decode a message from its binary wire form.
pub fn decode_binary<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    Ok(M::decode(bytes)?)
}

/// JSON marshaling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonCodec {
    /// Write every declared field, including those holding their default
    /// value. When false, default-valued fields are omitted from the output.
    pub emit_unpopulated: bool,
    /// Silently drop JSON keys that name no declared field. When false such
    /// keys are a decode error.
    pub discard_unknown: bool,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            emit_unpopulated: true,
            discard_unknown: false,
        }
    }
}

impl JsonCodec {
    /// Options for encoding: emit unpopulated fields or not.
    pub fn with_emit_unpopulated(mut self, emit: bool) -> Self {
        self.emit_unpopulated = emit;
        self
    }

    pub fn with_discard_unknown(mut self, discard: bool) -> Self {
        self.discard_unknown = discard;
        self
    }

    /// Serialize a message to JSON bytes.
    pub fn encode<M: RpcMessage>(&self, message: &M) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(message)?;
        if !self.emit_unpopulated {
            let template = schema_of::<M>()?;
            strip_unpopulated(&mut value, &template);
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// Parse JSON bytes into a message. An empty body yields the default message.
    pub fn decode<M: RpcMessage>(&self, bytes: &[u8]) -> Result<M> {
        let value = parse_body(bytes)?;
        self.decode_value(value)
    }

    /// Build a request message from an optional JSON body plus string
    /// parameters taken from the URL path or query.
    ///
    /// Parameters are coerced to the JSON kind the message declares for the
    /// field; a parameter overrides a body field of the same name. Repeated
    /// parameters for a list field accumulate.
    pub fn decode_with_params<M: RpcMessage>(
        &self,
        body: Option<&[u8]>,
        params: &[(String, String)],
    ) -> Result<M> {
        let mut value = match body {
            Some(bytes) => parse_body(bytes)?,
            None => Value::Object(Map::new()),
        };
        if params.is_empty() {
            return self.decode_value(value);
        }

        let template = schema_of::<M>()?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| TwinportError::decode("request body must be a JSON object"))?;
        for (key, raw) in params {
            let field = json_field_name(key);
            let kind = template.get(&field).unwrap_or(&Value::Null);
            match kind {
                Value::Array(_) => {
                    let entry = object
                        .entry(field)
                        .or_insert_with(|| Value::Array(Vec::new()));
                    match entry {
                        Value::Array(items) => items.push(Value::String(raw.clone())),
                        other => *other = Value::Array(vec![Value::String(raw.clone())]),
                    }
                }
                kind => {
                    object.insert(field, coerce_param(kind, raw));
                }
            }
        }
        self.decode_value(value)
    }

    fn decode_value<M: RpcMessage>(&self, mut value: Value) -> Result<M> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| TwinportError::decode("request body must be a JSON object"))?;

        let template = schema_of::<M>()?;
        let unknown: Vec<String> = object
            .keys()
            .filter(|key| template.get(key.as_str()).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            if !self.discard_unknown {
                return Err(TwinportError::decode(format!(
                    "unknown field \"{}\"",
                    unknown.join("\", \"")
                )));
            }
            for key in unknown {
                object.remove(&key);
            }
        }

        serde_json::from_value(value).map_err(|e| TwinportError::decode(e.to_string()))
    }
}

/// JSON rendering of `M::default()`: every declared field with its default.
fn schema_of<M: RpcMessage>() -> Result<Map<String, Value>> {
    match serde_json::to_value(M::default())? {
        Value::Object(map) => Ok(map),
        other => Err(TwinportError::Other(format!(
            "message does not serialize to a JSON object: {}",
            other
        ))),
    }
}

fn parse_body(bytes: &[u8]) -> Result<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(bytes).map_err(|e| TwinportError::decode(e.to_string()))
}

/// Remove fields whose value equals the message default, at every depth.
fn strip_unpopulated(value: &mut Value, template: &Map<String, Value>) {
    if let Value::Object(object) = value {
        object.retain(|key, field| {
            let default = template.get(key).unwrap_or(&Value::Null);
            !is_unpopulated(field, default)
        });
        object.values_mut().for_each(strip_nested);
    }
}

/// Nested messages carry no template; their defaults are the zero values.
/// A nested message that is set but empty stays as `{}`.
fn strip_nested(value: &mut Value) {
    match value {
        Value::Object(object) => {
            object.retain(|_, field| !is_zero(field));
            object.values_mut().for_each(strip_nested);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nested),
        _ => {}
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn is_unpopulated(field: &Value, default: &Value) -> bool {
    match field {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        other => other == default,
    }
}

/// Parameter names arrive as written in the URL; JSON fields are lowerCamelCase.
fn json_field_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn coerce_param(kind: &Value, raw: &str) -> Value {
    match kind {
        Value::Bool(_) => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        Value::Number(_) => raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}
