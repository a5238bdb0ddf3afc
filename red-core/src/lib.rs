use serde::{Deserialize, Serialize};

pub mod merge;

pub use merge::{MergeEngine, MergeError, TextMergeEngine};

/// Kind of a single-character edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EditKind {
    Insert = 0,
    Delete = 1,
}

/// One edit operation produced by a local editor.
///
/// `pos` is a zero-based document offset. For deletes the character is
/// carried along but the engine only uses the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub kind: EditKind,
    pub pos: u32,
    pub ch: char,
}

impl Edit {
    pub fn insert(pos: u32, ch: char) -> Self {
        Self { kind: EditKind::Insert, pos, ch }
    }

    pub fn delete(pos: u32) -> Self {
        Self { kind: EditKind::Delete, pos, ch: '\0' }
    }

    pub fn is_insert(&self) -> bool {
        self.kind == EditKind::Insert
    }
}

impl std::fmt::Display for Edit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EditKind::Insert => write!(f, "insert {:?} at {}", self.ch, self.pos),
            EditKind::Delete => write!(f, "delete at {}", self.pos),
        }
    }
}
