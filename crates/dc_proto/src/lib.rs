//! dc_proto - Wire protocol for Darklock Courier
//!
//! Every packet is a frame carrying a one-byte opcode and a JSON payload.
//! The server relays message bodies as opaque sealed bytes.
//!
//! # Modules
//! - `frame`   - length-delimited frame codec over any async stream
//! - `opcode`  - the fixed opcode set
//! - `records` - one payload record per opcode
//! - `packet`  - typed client/server packets built from frames
//! - `model`   - `Message`, `MessageStatus`, `User`

pub mod error;
pub mod frame;
pub mod model;
pub mod opcode;
pub mod packet;
pub mod records;

pub use error::{FrameError, ProtocolError};
pub use frame::{read_frame, write_frame, Frame, MAX_PAYLOAD_LEN};
pub use model::{validate_username, Message, MessageStatus, User};
pub use opcode::Opcode;
pub use packet::{ClientPacket, ServerPacket};
pub use records::PROTOCOL_VERSION;
