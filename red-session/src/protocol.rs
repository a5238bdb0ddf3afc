//! Session messages and their binary encoding.
//!
//! Only two kinds exist: an unconfirmed INVITE and an EDIT carrying one
//! [`Edit`]. New kinds are added as variants, never as optional fields.
//!
//! Wire format (bincode-encoded, one message per WebSocket frame):
//! ```text
//! ┌─────────┬──────────┬─────────────┬──────────────────────┐
//! │ variant │ sender   │ recipient   │ edit (EDIT only)     │
//! │ varint  │ string   │ string      │ kind · pos · char    │
//! └─────────┴──────────┴─────────────┴──────────────────────┘
//! ```

use red_core::Edit;
use serde::{Deserialize, Serialize};

/// Discriminant of a [`Message`], handy for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Invite = 1,
    Edit = 2,
}

/// A message exchanged between two sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Asks the recipient to add the sender to its peer set.
    Invite { sender: String, recipient: String },
    /// A local edit relayed from the sender.
    Edit {
        sender: String,
        recipient: String,
        edit: Edit,
    },
}

impl Message {
    pub fn invite(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self::Invite {
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }

    pub fn edit(sender: impl Into<String>, recipient: impl Into<String>, edit: Edit) -> Self {
        Self::Edit {
            sender: sender.into(),
            recipient: recipient.into(),
            edit,
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Invite { .. } => MessageType::Invite,
            Self::Edit { .. } => MessageType::Edit,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::Invite { sender, .. } | Self::Edit { sender, .. } => sender,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Self::Invite { recipient, .. } | Self::Edit { recipient, .. } => recipient,
        }
    }

    /// Copy of this message addressed to `recipient`.
    pub fn readdressed(&self, recipient: &str) -> Self {
        match self {
            Self::Invite { sender, .. } => Self::invite(sender.as_str(), recipient),
            Self::Edit { sender, edit, .. } => Self::edit(sender.as_str(), recipient, *edit),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    TrailingBytes(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
        }
    }
}

impl std::error::Error for ProtocolError {}
