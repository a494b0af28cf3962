//! Payload records, one per opcode. All are JSON objects with camelCase
//! field names; any field may be omitted and falls back to its default.

use serde::{Deserialize, Serialize};

use crate::model::{Message, User};

/// Version sent in `Login` and checked by the server.
pub const PROTOCOL_VERSION: &str = "1";

// ── client → server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    pub username: String,
    /// Hex-encoded ServerProof.
    pub server_proof: String,
    /// Base64 of the private key encrypted under the user's LocalKey.
    pub encrypted_private_key: String,
    pub armored_public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginRequest {
    pub username: String,
    pub server_proof: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageTo {
    pub message: Message,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LookupUser {
    pub username: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Ping {
    pub nonce: u64,
}

// ── server → client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginResult {
    pub username: String,
    pub success: bool,
    pub message: String,
    pub block_allowance: u64,
    pub msg_cost: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserResult {
    pub success: bool,
    pub message: String,
    pub user: Option<User>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessageResult {
    pub success: bool,
    pub message: String,
    /// The sender's local ID for the message, echoed back.
    pub id: u64,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub message: Message,
    #[serde(default)]
    pub from: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockAllowanceUpdate {
    pub blocks: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pong {
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_result_uses_camel_case() {
        let json = serde_json::to_value(LoginResult {
            username: "alice".into(),
            success: true,
            message: "welcome".into(),
            block_allowance: 100,
            msg_cost: 1,
        })
        .unwrap();
        assert_eq!(json["blockAllowance"], 100);
        assert_eq!(json["msgCost"], 1);
    }

    #[test]
    fn omitted_fields_default() {
        let r: SendMessageResult = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(r, SendMessageResult { success: true, ..Default::default() });

        let u: UserResult = serde_json::from_str("{}").unwrap();
        assert!(!u.success);
        assert!(u.user.is_none());
    }
}
