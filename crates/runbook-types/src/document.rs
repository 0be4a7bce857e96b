//! Ordered, id-unique sequence of blocks.
//!
//! Order matters: `Sequential` dependencies point at the immediately
//! preceding block, so every mutation preserves relative order.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::block::Block;
use crate::codec::{self, BlockDeserializationError};
use crate::ids::BlockId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("duplicate block id: {0}")]
    DuplicateId(BlockId),

    #[error("block not found: {0}")]
    NotFound(BlockId),
}

/// A runbook document.
#[derive(Clone, Debug, Default)]
pub struct Document {
    blocks: IndexMap<BlockId, Block>,
}

// IndexMap equality ignores order; documents are order-sensitive.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.blocks.len() == other.blocks.len() && self.blocks.iter().eq(other.blocks.iter())
    }
}

impl Eq for Document {}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from blocks in order, rejecting duplicate ids.
    pub fn from_blocks(blocks: impl IntoIterator<Item = Block>) -> Result<Self, DocumentError> {
        let mut doc = Self::new();
        for block in blocks {
            doc.push(block)?;
        }
        Ok(doc)
    }

    /// Decode stored records one by one.
    ///
    /// Returns one result per record so the caller chooses the failure policy
    /// (skip, placeholder, abort).
    pub fn decode_all<I, B>(records: I) -> Vec<Result<Block, BlockDeserializationError>>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        records
            .into_iter()
            .map(|bytes| codec::deserialize(bytes.as_ref()))
            .collect()
    }

    /// Append a block at the end.
    pub fn push(&mut self, block: Block) -> Result<(), DocumentError> {
        if self.blocks.contains_key(&block.id) {
            return Err(DocumentError::DuplicateId(block.id));
        }
        self.blocks.insert(block.id.clone(), block);
        Ok(())
    }

    /// Insert after `after` (`None` = at the beginning).
    pub fn insert_after(&mut self, after: Option<&BlockId>, block: Block) -> Result<(), DocumentError> {
        if self.blocks.contains_key(&block.id) {
            return Err(DocumentError::DuplicateId(block.id));
        }
        let index = match after {
            None => 0,
            Some(id) => {
                self.blocks
                    .get_index_of(id)
                    .ok_or_else(|| DocumentError::NotFound(id.clone()))?
                    + 1
            }
        };
        self.blocks.shift_insert(index, block.id.clone(), block);
        Ok(())
    }

    /// Swap in a new version of an existing block, keeping its position.
    ///
    /// Returns the previous version.
    pub fn replace(&mut self, block: Block) -> Result<Block, DocumentError> {
        match self.blocks.get_mut(&block.id) {
            Some(slot) => Ok(std::mem::replace(slot, block)),
            None => Err(DocumentError::NotFound(block.id)),
        }
    }

    /// Remove a block, preserving the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<Block> {
        self.blocks.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    /// Index of a block in document order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.blocks.get_index_of(id)
    }

    /// The block immediately before `id`, if any.
    pub fn predecessor(&self, id: &str) -> Option<&Block> {
        let pos = self.position(id)?;
        let prev = pos.checked_sub(1)?;
        self.blocks.get_index(prev).map(|(_, b)| b)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &BlockId> {
        self.blocks.keys()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.blocks.values())
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let blocks = Vec::<Block>::deserialize(deserializer)?;
        Document::from_blocks(blocks).map_err(serde::de::Error::custom)
    }
}
