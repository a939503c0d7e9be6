use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message buffer is not NUL-sentineled")]
    Unterminated,
    #[error("message has no recognized `y` type")]
    Unclassifiable,
    #[error("encode buffer of {capacity} bytes is too small for this message")]
    BufferTooSmall { capacity: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;
