pub mod decode;
pub mod encode;
pub mod format;
pub mod framing;
pub mod messages;
pub mod value;

pub use decode::*;
pub use encode::*;
pub use format::*;
pub use framing::*;
pub use messages::*;
pub use value::*;

/// Errors raised while decoding typed values or messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid length field: {0}")]
    InvalidLength(i64),

    #[error("Unknown type tag: {0:?}")]
    UnknownType(String),

    #[error("Invalid UTF-8 in {0} value")]
    InvalidUtf8(&'static str),

    #[error("Invalid digit run in {0} value: {1:?}")]
    InvalidDigits(&'static str, String),

    #[error("Invalid h-key entry: {0:?}")]
    InvalidHKey(String),

    #[error("Unsupported compression flag: {0}")]
    UnsupportedCompression(u8),

    #[error("Frame length {declared} does not match body length {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("Values nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("{0} trailing bytes after last object")]
    TrailingBytes(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
