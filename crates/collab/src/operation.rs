//! Edit operations and their application to document content.
//!
//! Positions and lengths count Unicode scalar values, so a multi-byte
//! character can never be split by an edit. `version` on an incoming
//! operation is the client's basis version; after application the
//! controller stamps the operation with the new version.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("insert position {pos} out of range (document length {len})")]
    InsertOutOfRange { pos: usize, len: usize },

    #[error("delete range {pos}..{end} out of range (document length {len})")]
    DeleteOutOfRange { pos: usize, end: usize, len: usize },

    #[error("insert text must not be empty")]
    EmptyInsert,

    #[error("delete length must be positive")]
    EmptyDelete,

    #[error("undo cannot be applied directly")]
    DirectUndo,

    #[error("undo is not invertible")]
    NotInvertible,
}

/// A single edit submitted by a client or rebroadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        pos: usize,
        text: String,
        #[serde(default)]
        version: u64,
    },
    Delete {
        pos: usize,
        len: usize,
        /// Removed text, filled by the server before application so the
        /// operation can later be inverted. Clients never send it.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        text: String,
        #[serde(default)]
        version: u64,
    },
    Undo {
        #[serde(default, skip_serializing)]
        version: u64,
    },
}

impl Operation {
    /// The document version this operation was composed against.
    pub fn basis_version(&self) -> u64 {
        match self {
            Operation::Insert { version, .. }
            | Operation::Delete { version, .. }
            | Operation::Undo { version } => *version,
        }
    }

    /// Overwrites the version field with the server-assigned version.
    pub fn stamp(&mut self, version: u64) {
        match self {
            Operation::Insert { version: v, .. }
            | Operation::Delete { version: v, .. }
            | Operation::Undo { version: v } => *v = version,
        }
    }

    pub fn is_undo(&self) -> bool {
        matches!(self, Operation::Undo { .. })
    }

    /// True for operations that would leave the content untouched, such
    /// as the inversion of a delete whose text was never captured.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert { text, .. } => text.is_empty(),
            Operation::Delete { len, .. } => *len == 0,
            Operation::Undo { .. } => true,
        }
    }

    /// Captures the text a delete will remove, before it is applied.
    pub fn capture_delete_text(&mut self, content: &str) -> Result<(), OpError> {
        if let Operation::Delete { pos, len, text, .. } = self {
            if *len == 0 {
                return Err(OpError::EmptyDelete);
            }
            let total = char_count(content);
            let start = byte_index(content, *pos);
            let end = byte_index(content, *pos + *len);
            match (start, end) {
                (Some(start), Some(end)) => *text = content[start..end].to_string(),
                _ => {
                    return Err(OpError::DeleteOutOfRange {
                        pos: *pos,
                        end: *pos + *len,
                        len: total,
                    })
                }
            }
        }
        Ok(())
    }

    /// Applies the operation to `content`, rejecting out-of-range
    /// positions. Undo has no direct application; it is resolved against
    /// the operation history by the controller.
    pub fn apply(&self, content: &str) -> Result<String, OpError> {
        let total = char_count(content);
        match self {
            Operation::Insert { pos, text, .. } => {
                if text.is_empty() {
                    return Err(OpError::EmptyInsert);
                }
                let at = byte_index(content, *pos)
                    .ok_or(OpError::InsertOutOfRange { pos: *pos, len: total })?;
                Ok(splice(content, at, at, text))
            }
            Operation::Delete { pos, len, .. } => {
                if *len == 0 {
                    return Err(OpError::EmptyDelete);
                }
                let start = byte_index(content, *pos);
                let end = byte_index(content, *pos + *len);
                match (start, end) {
                    (Some(start), Some(end)) => Ok(splice(content, start, end, "")),
                    _ => Err(OpError::DeleteOutOfRange {
                        pos: *pos,
                        end: *pos + *len,
                        len: total,
                    }),
                }
            }
            Operation::Undo { .. } => Err(OpError::DirectUndo),
        }
    }

    /// Applies with positions clamped into range. Only used on entries
    /// popped from the undo log, which were validated when first
    /// accepted; live submissions go through [`Operation::apply`].
    pub fn apply_clamped(&self, content: &str) -> String {
        let total = char_count(content);
        match self {
            Operation::Insert { pos, text, .. } => {
                let pos = (*pos).min(total);
                let at = byte_index(content, pos).unwrap_or(content.len());
                splice(content, at, at, text)
            }
            Operation::Delete { pos, len, .. } => {
                let pos = (*pos).min(total);
                let end_pos = pos.saturating_add(*len).min(total);
                let start = byte_index(content, pos).unwrap_or(content.len());
                let end = byte_index(content, end_pos).unwrap_or(content.len());
                splice(content, start, end, "")
            }
            Operation::Undo { .. } => content.to_string(),
        }
    }

    /// Builds the compensating operation. Inverting an inverted
    /// operation yields the original.
    pub fn invert(&self) -> Result<Operation, OpError> {
        match self {
            Operation::Insert { pos, text, version } => Ok(Operation::Delete {
                pos: *pos,
                len: char_count(text),
                text: text.clone(),
                version: *version,
            }),
            Operation::Delete {
                pos, text, version, ..
            } => Ok(Operation::Insert {
                pos: *pos,
                text: text.clone(),
                version: *version,
            }),
            Operation::Undo { .. } => Err(OpError::NotInvertible),
        }
    }
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `pos`-th character, `s.len()` for the one-past-end
/// position, `None` beyond that.
fn byte_index(s: &str, pos: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(pos)
}

fn splice(content: &str, start: usize, end: usize, insert: &str) -> String {
    let mut out = String::with_capacity(content.len() - (end - start) + insert.len());
    out.push_str(&content[..start]);
    out.push_str(insert);
    out.push_str(&content[end..]);
    out
}
