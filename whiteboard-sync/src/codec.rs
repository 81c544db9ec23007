//! Binary codec for operations and protocol frames.
//!
//! Everything on the wire is bincode (standard config, varint integers).
//! A decoded value is only handed out after it consumed the whole frame and,
//! for operations, passed [`Operation::validate`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::operation::Operation;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Encode(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Unknown variant tag, missing fields, or an operation that fails validation.
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),
}

/// Serialize any protocol value to a frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize a frame, rejecting trailing bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, consumed): (T, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::MalformedMessage(e.to_string()))?;
    if consumed != bytes.len() {
        return Err(CodecError::MalformedMessage(format!(
            "{} trailing bytes after payload",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

/// Encode a single operation.
#[inline]
pub fn encode_operation(op: &Operation) -> Result<Vec<u8>, CodecError> {
    encode(op)
}

/// Decode a single operation. Any failure is reported as `MalformedOperation`
/// and the caller must not apply anything.
pub fn decode_operation(bytes: &[u8]) -> Result<Operation, CodecError> {
    let op: Operation = decode(bytes).map_err(|e| match e {
        CodecError::MalformedMessage(reason) => CodecError::MalformedOperation(reason),
        other => other,
    })?;
    op.validate()?;
    Ok(op)
}
