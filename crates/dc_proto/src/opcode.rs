//! One-byte opcodes.
//!
//! Client-to-server opcodes live below `0x80`, server-to-client opcodes at or
//! above it. Ping/Pong sit in their own `0x1_` block.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // client → server
    Register = 0x01,
    Login = 0x02,
    SendMessageTo = 0x03,
    LookupUser = 0x04,
    Ping = 0x10,

    // server → client
    Pong = 0x11,
    LoginResult = 0x81,
    UserResult = 0x82,
    SendMessageResult = 0x83,
    IncomingMessage = 0x84,
    BlockAllowanceUpdate = 0x85,
    RegisterResult = 0x86,
}

impl Opcode {
    pub const ALL: [Opcode; 12] = [
        Opcode::Register,
        Opcode::Login,
        Opcode::SendMessageTo,
        Opcode::LookupUser,
        Opcode::Ping,
        Opcode::Pong,
        Opcode::LoginResult,
        Opcode::UserResult,
        Opcode::SendMessageResult,
        Opcode::IncomingMessage,
        Opcode::BlockAllowanceUpdate,
        Opcode::RegisterResult,
    ];

    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Register => "Register",
            Opcode::Login => "Login",
            Opcode::SendMessageTo => "SendMessageTo",
            Opcode::LookupUser => "LookupUser",
            Opcode::Ping => "Ping",
            Opcode::Pong => "Pong",
            Opcode::LoginResult => "LoginResult",
            Opcode::UserResult => "UserResult",
            Opcode::SendMessageResult => "SendMessageResult",
            Opcode::IncomingMessage => "IncomingMessage",
            Opcode::BlockAllowanceUpdate => "BlockAllowanceUpdate",
            Opcode::RegisterResult => "RegisterResult",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
