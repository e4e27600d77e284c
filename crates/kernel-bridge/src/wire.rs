//! Classic comm wire shape handed to widget runtimes.
//!
//! Widget runtimes written against the classic notebook expect comm
//! messages as plain JSON envelopes where `content` is `{comm_id, data}`
//! and binary buffers travel as base64 strings. This module converts
//! typed kernel messages into that shape and builds outgoing kernel
//! messages from raw `msg_type` + JSON content.

use bytes::Bytes;
use jupyter_protocol::{Header, JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Buffers cross the classic boundary as base64 strings. A missing or
/// `null` list decodes to no buffers.
mod base64_buffers {
    use base64::prelude::*;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(buffers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(buffers.iter().map(|buffer| BASE64_STANDARD.encode(buffer)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        let mut buffers = Vec::new();
        for encoded in Option::<Vec<String>>::deserialize(deserializer)?
            .into_iter()
            .flatten()
        {
            let raw = BASE64_STANDARD
                .decode(encoded.as_bytes())
                .map_err(D::Error::custom)?;
            buffers.push(Bytes::from(raw));
        }
        Ok(buffers)
    }
}

/// Content of a classic comm message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommContent {
    pub comm_id: String,

    #[serde(default)]
    pub data: Value,

    /// Only present on comm_open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// A comm message in the classic envelope shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommWireMessage {
    pub header: Header,

    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Value,

    pub content: CommContent,

    #[serde(default, with = "base64_buffers")]
    pub buffers: Vec<Bytes>,
}

impl CommWireMessage {
    /// Translate a kernel comm_open / comm_msg / comm_close into the classic
    /// shape. Any other message kind yields `None`.
    pub fn from_message(message: &JupyterMessage) -> Option<Self> {
        let content = match &message.content {
            JupyterMessageContent::CommOpen(open) => CommContent {
                comm_id: open.comm_id.0.clone(),
                data: serde_json::to_value(&open.data).unwrap_or_default(),
                target_name: Some(open.target_name.clone()),
            },
            JupyterMessageContent::CommMsg(msg) => CommContent {
                comm_id: msg.comm_id.0.clone(),
                data: serde_json::to_value(&msg.data).unwrap_or_default(),
                target_name: None,
            },
            JupyterMessageContent::CommClose(close) => CommContent {
                comm_id: close.comm_id.0.clone(),
                data: serde_json::to_value(&close.data).unwrap_or_default(),
                target_name: None,
            },
            _ => return None,
        };

        Some(CommWireMessage {
            header: message.header.clone(),
            parent_header: message.parent_header.clone(),
            metadata: message.metadata.clone(),
            content,
            buffers: message.buffers.clone(),
        })
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn comm_id(&self) -> &str {
        &self.content.comm_id
    }

    /// The widget protocol `method` field (`"update"`, `"custom"`, ...).
    pub fn method(&self) -> Option<&str> {
        self.content.data.get("method").and_then(|m| m.as_str())
    }
}

/// Build a kernel message from its `msg_type` and raw JSON content.
pub fn build_message(msg_type: &str, content: Value) -> Result<JupyterMessage> {
    let content = JupyterMessageContent::from_type_and_content(msg_type, content).map_err(|e| {
        BridgeError::Protocol {
            msg_type: msg_type.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(JupyterMessage::new(content, None))
}
