use thiserror::Error;

/// Failures reading or writing a frame. All of these end the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Truncated frame: expected {expected} bytes, stream ended after {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Frame payload of {0} bytes exceeds the maximum")]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A well-formed frame whose contents could not be interpreted.
/// The frame is dropped; the connection stays up.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Opcode {opcode} is not valid in this direction")]
    WrongDirection { opcode: &'static str },

    #[error("Malformed {opcode} payload: {source}")]
    Malformed {
        opcode: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {opcode} payload: {source}")]
    Encode {
        opcode: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
