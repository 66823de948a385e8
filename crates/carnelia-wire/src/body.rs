//! Message bodies.
//!
//! A [`Body`] keeps the three fields the runtime understands (`type`,
//! `msg_id`, `in_reply_to`) and leaves every other field untouched in
//! `fields`. Services convert to and from their own typed payloads with
//! [`Body::from_payload`] and [`Body::decode`]; payloads are serde enums
//! tagged by `type`:
//!
//! ```rust
//! use carnelia_wire::Body;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(tag = "type", rename_all = "snake_case")]
//! enum Payload {
//!     Broadcast { message: i64 },
//!     BroadcastOk,
//! }
//!
//! let body = Body::from_payload(&Payload::Broadcast { message: 7 }).unwrap();
//! assert_eq!(body.kind, "broadcast");
//! assert!(matches!(body.decode::<Payload>(), Ok(Payload::Broadcast { message: 7 })));
//! ```

use crate::error::{ErrorCode, Result, RpcError, WireError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type discriminator of the failure body.
pub const ERROR_KIND: &str = "error";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Body {
    /// An empty body of the given type.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg_id: None,
            in_reply_to: None,
            fields: Map::new(),
        }
    }

    /// Serialize a `type`-tagged payload into a body.
    pub fn from_payload<P: Serialize>(payload: &P) -> Result<Self> {
        let mut fields = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => return Err(WireError::NotAnObject(other.to_string())),
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(WireError::MissingType),
        };
        // Envelope bookkeeping belongs to the runtime, never to a payload.
        fields.remove("msg_id");
        fields.remove("in_reply_to");

        Ok(Self {
            kind,
            msg_id: None,
            in_reply_to: None,
            fields,
        })
    }

    /// Deserialize the body into a `type`-tagged payload.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    pub fn with_msg_id(mut self, msg_id: u64) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn in_reply_to(mut self, msg_id: u64) -> Self {
        self.in_reply_to = Some(msg_id);
        self
    }

    /// Add or replace a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// An `error` body carrying a Maelstrom error code.
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Self::new(ERROR_KIND)
            .with_field("code", code.code())
            .with_field("text", text.into())
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR_KIND
    }

    /// The failure carried by an `error` body, if this is one.
    pub fn failure(&self) -> Option<RpcError> {
        if !self.is_error() {
            return None;
        }
        let code = self
            .fields
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
            .map(ErrorCode::from_code)
            .unwrap_or(ErrorCode::Crash);
        let text = self
            .fields
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(RpcError::new(code, text))
    }
}

impl From<&RpcError> for Body {
    fn from(err: &RpcError) -> Self {
        Body::error(err.code, err.text.clone())
    }
}
