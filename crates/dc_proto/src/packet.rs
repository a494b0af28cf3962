//! Typed packets: a frame whose opcode and payload have been checked.

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::ProtocolError,
    frame::Frame,
    opcode::Opcode,
    records::*,
};

fn encode<T: Serialize>(opcode: Opcode, record: &T) -> Result<Frame, ProtocolError> {
    let payload = serde_json::to_vec(record).map_err(|source| ProtocolError::Encode {
        opcode: opcode.name(),
        source,
    })?;
    Ok(Frame::new(opcode.as_u8(), payload))
}

fn decode<T: DeserializeOwned>(opcode: Opcode, payload: &[u8]) -> Result<T, ProtocolError> {
    // An empty payload is an empty record.
    let payload = if payload.is_empty() { b"{}".as_slice() } else { payload };
    serde_json::from_slice(payload).map_err(|source| ProtocolError::Malformed {
        opcode: opcode.name(),
        source,
    })
}

fn known_opcode(frame: &Frame) -> Result<Opcode, ProtocolError> {
    Opcode::from_u8(frame.opcode).ok_or(ProtocolError::UnknownOpcode(frame.opcode))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Register(RegisterRequest),
    Login(LoginRequest),
    SendMessageTo(SendMessageTo),
    LookupUser(LookupUser),
    Ping(Ping),
}

impl ClientPacket {
    pub fn opcode(&self) -> Opcode {
        match self {
            ClientPacket::Register(_) => Opcode::Register,
            ClientPacket::Login(_) => Opcode::Login,
            ClientPacket::SendMessageTo(_) => Opcode::SendMessageTo,
            ClientPacket::LookupUser(_) => Opcode::LookupUser,
            ClientPacket::Ping(_) => Opcode::Ping,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let op = self.opcode();
        match self {
            ClientPacket::Register(r) => encode(op, r),
            ClientPacket::Login(r) => encode(op, r),
            ClientPacket::SendMessageTo(r) => encode(op, r),
            ClientPacket::LookupUser(r) => encode(op, r),
            ClientPacket::Ping(r) => encode(op, r),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let op = known_opcode(frame)?;
        let p = &frame.payload;
        Ok(match op {
            Opcode::Register => ClientPacket::Register(decode(op, p)?),
            Opcode::Login => ClientPacket::Login(decode(op, p)?),
            Opcode::SendMessageTo => ClientPacket::SendMessageTo(decode(op, p)?),
            Opcode::LookupUser => ClientPacket::LookupUser(decode(op, p)?),
            Opcode::Ping => ClientPacket::Ping(decode(op, p)?),
            other => return Err(ProtocolError::WrongDirection { opcode: other.name() }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    RegisterResult(RegisterResult),
    LoginResult(LoginResult),
    UserResult(UserResult),
    SendMessageResult(SendMessageResult),
    IncomingMessage(IncomingMessage),
    BlockAllowanceUpdate(BlockAllowanceUpdate),
    Pong(Pong),
}

impl ServerPacket {
    pub fn opcode(&self) -> Opcode {
        match self {
            ServerPacket::RegisterResult(_) => Opcode::RegisterResult,
            ServerPacket::LoginResult(_) => Opcode::LoginResult,
            ServerPacket::UserResult(_) => Opcode::UserResult,
            ServerPacket::SendMessageResult(_) => Opcode::SendMessageResult,
            ServerPacket::IncomingMessage(_) => Opcode::IncomingMessage,
            ServerPacket::BlockAllowanceUpdate(_) => Opcode::BlockAllowanceUpdate,
            ServerPacket::Pong(_) => Opcode::Pong,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let op = self.opcode();
        match self {
            ServerPacket::RegisterResult(r) => encode(op, r),
            ServerPacket::LoginResult(r) => encode(op, r),
            ServerPacket::UserResult(r) => encode(op, r),
            ServerPacket::SendMessageResult(r) => encode(op, r),
            ServerPacket::IncomingMessage(r) => encode(op, r),
            ServerPacket::BlockAllowanceUpdate(r) => encode(op, r),
            ServerPacket::Pong(r) => encode(op, r),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let op = known_opcode(frame)?;
        let p = &frame.payload;
        Ok(match op {
            Opcode::RegisterResult => ServerPacket::RegisterResult(decode(op, p)?),
            Opcode::LoginResult => ServerPacket::LoginResult(decode(op, p)?),
            Opcode::UserResult => ServerPacket::UserResult(decode(op, p)?),
            Opcode::SendMessageResult => ServerPacket::SendMessageResult(decode(op, p)?),
            Opcode::IncomingMessage => ServerPacket::IncomingMessage(decode(op, p)?),
            Opcode::BlockAllowanceUpdate => ServerPacket::BlockAllowanceUpdate(decode(op, p)?),
            Opcode::Pong => ServerPacket::Pong(decode(op, p)?),
            other => return Err(ProtocolError::WrongDirection { opcode: other.name() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[test]
    fn client_packet_decodes_from_its_frame() {
        let packet = ClientPacket::LookupUser(LookupUser { username: "bob".into() });
        let frame = packet.to_frame().unwrap();
        assert_eq!(frame.opcode, 0x04);
        assert_eq!(ClientPacket::from_frame(&frame).unwrap(), packet);
    }

    #[test]
    fn server_packet_with_message_decodes() {
        let packet = ServerPacket::IncomingMessage(IncomingMessage {
            message: Message::new("alice", "bob", b"sealed".to_vec()),
            from: "alice".into(),
        });
        let frame = packet.to_frame().unwrap();
        assert_eq!(ServerPacket::from_frame(&frame).unwrap(), packet);
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let frame = Frame::new(0x7f, b"{}".to_vec());
        assert!(matches!(
            ClientPacket::from_frame(&frame),
            Err(ProtocolError::UnknownOpcode(0x7f))
        ));
        assert!(matches!(
            ServerPacket::from_frame(&frame),
            Err(ProtocolError::UnknownOpcode(0x7f))
        ));
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let frame = ServerPacket::Pong(Pong { nonce: 1 }).to_frame().unwrap();
        assert!(matches!(
            ClientPacket::from_frame(&frame),
            Err(ProtocolError::WrongDirection { opcode: "Pong" })
        ));
    }

    #[test]
    fn malformed_payload_is_a_protocol_error() {
        let frame = Frame::new(Opcode::Login.as_u8(), b"not json".to_vec());
        assert!(matches!(
            ClientPacket::from_frame(&frame),
            Err(ProtocolError::Malformed { opcode: "Login", .. })
        ));
        // SendMessageTo requires the message field.
        let frame = Frame::new(Opcode::SendMessageTo.as_u8(), b"{}".to_vec());
        assert!(ClientPacket::from_frame(&frame).is_err());
    }

    #[test]
    fn empty_payload_is_an_empty_record() {
        let frame = Frame::new(Opcode::Ping.as_u8(), Vec::new());
        assert_eq!(
            ClientPacket::from_frame(&frame).unwrap(),
            ClientPacket::Ping(Ping::default())
        );
    }
}
