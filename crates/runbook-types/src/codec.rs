//! Block persistence codec.
//!
//! `serialize` and `deserialize` are mutual inverses for every registered
//! variant. Decoding resolves the variant from the `type` discriminant before
//! touching the payload, so an unregistered type and a malformed payload are
//! reported as different errors. Both name the offending block id.

use serde_json::Value;
use thiserror::Error;

use crate::block::{Block, BlockKind};
use crate::ids::BlockId;

/// Why a stored block record could not be turned back into a [`Block`].
///
/// The storage layer decides whether to skip, substitute a placeholder, or
/// abort the load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockDeserializationError {
    /// Bytes are not a JSON object at all.
    #[error("malformed block record: {0}")]
    Malformed(String),

    /// Record has no string `id`.
    #[error("block record has no id")]
    MissingId,

    /// Record has no `type` discriminant.
    #[error("block {id}: missing type discriminant")]
    MissingType { id: BlockId },

    /// Discriminant names no registered variant.
    #[error("block {id}: unregistered block type {type_name:?}")]
    UnknownType { id: BlockId, type_name: String },

    /// Envelope or payload failed schema validation.
    #[error("block {id}: invalid {type_name} block: {message}")]
    InvalidPayload {
        id: BlockId,
        type_name: String,
        message: String,
    },
}

impl BlockDeserializationError {
    /// The offending block id, when the record got far enough to have one.
    pub fn block_id(&self) -> Option<&BlockId> {
        match self {
            Self::Malformed(_) | Self::MissingId => None,
            Self::MissingType { id }
            | Self::UnknownType { id, .. }
            | Self::InvalidPayload { id, .. } => Some(id),
        }
    }
}

/// Encode a block as a flat JSON record.
pub fn serialize(block: &Block) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(block)
}

/// Decode a block from bytes produced by [`serialize`].
pub fn deserialize(bytes: &[u8]) -> Result<Block, BlockDeserializationError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| BlockDeserializationError::Malformed(e.to_string()))?;
    deserialize_value(value)
}

/// Decode a block from an already-parsed JSON value.
pub fn deserialize_value(value: Value) -> Result<Block, BlockDeserializationError> {
    let Value::Object(ref record) = value else {
        return Err(BlockDeserializationError::Malformed(format!(
            "expected object, got {}",
            json_type_name(&value)
        )));
    };

    let id = record
        .get("id")
        .and_then(Value::as_str)
        .map(BlockId::new)
        .ok_or(BlockDeserializationError::MissingId)?;

    let type_name = match record.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => return Err(BlockDeserializationError::MissingType { id }),
    };

    if BlockKind::from_str(&type_name).is_none() {
        return Err(BlockDeserializationError::UnknownType { id, type_name });
    }

    serde_json::from_value(value).map_err(|e| BlockDeserializationError::InvalidPayload {
        id,
        type_name,
        message: e.to_string(),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
