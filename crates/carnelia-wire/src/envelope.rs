//! Message envelope and node identifiers.

use crate::body::Body;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Identifier of a node, client or service in the cluster (`n1`, `c4`, `seq-kv`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A routed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

impl Message {
    pub fn new(src: impl Into<NodeId>, dest: impl Into<NodeId>, body: Body) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    /// Decode one line of input.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Encode as a single line, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The message type discriminator.
    pub fn kind(&self) -> &str {
        &self.body.kind
    }

    /// Whether this message answers an earlier request.
    pub fn is_reply(&self) -> bool {
        self.body.in_reply_to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_line_with_extra_fields() {
        let line = r#"{"id":3,"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":1,"message":42}}"#;
        let msg = Message::from_line(line).unwrap();

        assert_eq!(msg.src, NodeId::new("c1"));
        assert_eq!(msg.dest, NodeId::new("n1"));
        assert_eq!(msg.kind(), "broadcast");
        assert_eq!(msg.body.msg_id, Some(1));
        assert!(!msg.is_reply());
        assert_eq!(msg.body.fields.get("message"), Some(&json!(42)));
    }

    #[test]
    fn test_encoded_line_has_no_newline() {
        let msg = Message::new("n1", "c1", Body::new("broadcast_ok").in_reply_to(5));
        let line = msg.to_line().unwrap();

        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["body"]["in_reply_to"], json!(5));
        assert!(value["body"].get("msg_id").is_none());
    }

    #[test]
    fn test_garbage_line_is_rejected() {
        assert!(Message::from_line("not json").is_err());
        assert!(Message::from_line(r#"{"src":"n1"}"#).is_err());
    }
}
