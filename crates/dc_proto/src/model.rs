//! Domain records shared by client, server and store.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Delivery status of an outbound message.
///
/// Allowed transitions: `Pending → Sent`, `Pending → Failed`,
/// `Failed → Sent`. Nothing leaves `Sent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    /// Status after a delivery acknowledgement, or `None` if the ack does
    /// not apply (the message is already `Sent`).
    ///
    /// A failed ack for a `Failed` message keeps it `Failed`.
    pub fn after_ack(self, delivered: bool) -> Option<MessageStatus> {
        match (self, delivered) {
            (MessageStatus::Sent, _) => None,
            (_, true) => Some(MessageStatus::Sent),
            (_, false) => Some(MessageStatus::Failed),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }
}

/// A message. `body` is ciphertext sealed to the recipient and travels as
/// base64 in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sequence number in the owning partition of the local store.
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Body sealed to the sender, kept only in the sender's local store so
    /// their own history stays readable. Never sent.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
    pub sender_copy: Option<Vec<u8>>,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: 0,
            from: from.into(),
            to: to.into(),
            body,
            status: MessageStatus::Pending,
            timestamp: Utc::now(),
            sender_copy: None,
        }
    }

    /// Copy of this message as it goes on the wire.
    pub fn for_wire(&self) -> Message {
        Message {
            sender_copy: None,
            ..self.clone()
        }
    }
}

/// Public view of a user: what the server returns from a lookup and what
/// the client caches in its users partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    /// Armored public key text.
    #[serde(default)]
    pub public_key: String,
}

pub const USERNAME_MAX_LEN: usize = 32;

/// Usernames are 1–32 characters of `[A-Za-z0-9_.-]`. They double as key
/// file names, so nothing path-like gets through.
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("username must not be empty".into());
    }
    if name.len() > USERNAME_MAX_LEN {
        return Err(format!("username must be at most {USERNAME_MAX_LEN} characters"));
    }
    if name == "." || name == ".." {
        return Err("username must not be a relative path".into());
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(format!("username contains invalid character {c:?}"));
    }
    Ok(())
}

pub(crate) mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_bytes_opt {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
