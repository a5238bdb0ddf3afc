//! Merge engine contract and the yrs-backed text engine.
//!
//! The session hands every remote [`Edit`] to a [`MergeEngine`] and forwards
//! the returned text downstream. Engines are owned by exactly one task, so
//! `apply` takes `&mut self` and implementations need no internal locking.

use thiserror::Error;
use yrs::{Doc, GetString, OffsetKind, Options, Text, TextRef, Transact};

use crate::{Edit, EditKind};

/// Name of the shared text type inside the yrs document.
const CONTENT: &str = "content";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Edit position {pos} out of bounds (document length {len})")]
    OutOfBounds { pos: u32, len: u32 },
    #[error("Cannot delete from an empty document")]
    EmptyDocument,
    #[error("Edit position {pos} falls inside a surrogate pair")]
    SplitsCharacter { pos: u32 },
}

/// Applies edit operations and reports the converged document text.
pub trait MergeEngine: Send + 'static {
    /// Apply one edit and return the full document text afterwards.
    fn apply(&mut self, edit: &Edit) -> Result<String, MergeError>;

    /// Current document text without applying anything.
    fn text(&self) -> String;
}

/// Plain-text document stored in a yrs `TextRef`.
///
/// Offsets are counted in UTF-16 code units, so a BMP character is one unit.
/// An offset between the two halves of a surrogate pair is rejected, and a
/// delete at the start of a pair removes the whole character.
pub struct TextMergeEngine {
    doc: Doc,
    content: TextRef,
}

impl TextMergeEngine {
    pub fn new() -> Self {
        let mut options = Options::default();
        options.offset_kind = OffsetKind::Utf16;
        let doc = Doc::with_options(options);
        let content = doc.get_or_insert_text(CONTENT);
        Self { doc, content }
    }

    /// Create an engine pre-populated with `initial` text.
    pub fn with_text(initial: &str) -> Self {
        let engine = Self::new();
        {
            let mut txn = engine.doc.transact_mut();
            engine.content.insert(&mut txn, 0, initial);
        }
        engine
    }

    /// Document length in offset units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TextMergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeEngine for TextMergeEngine {
    fn apply(&mut self, edit: &Edit) -> Result<String, MergeError> {
        let mut txn = self.doc.transact_mut();
        let len = self.content.len(&txn);
        let current = self.content.get_string(&txn);

        match edit.kind {
            EditKind::Insert => {
                if edit.pos > len {
                    return Err(MergeError::OutOfBounds { pos: edit.pos, len });
                }
                if edit.pos < len {
                    unit_width_at(&current, edit.pos)?;
                }
                let mut buf = [0u8; 4];
                self.content
                    .insert(&mut txn, edit.pos, edit.ch.encode_utf8(&mut buf));
            }
            EditKind::Delete => {
                if len == 0 {
                    return Err(MergeError::EmptyDocument);
                }
                if edit.pos >= len {
                    return Err(MergeError::OutOfBounds { pos: edit.pos, len });
                }
                let width = unit_width_at(&current, edit.pos)?;
                self.content.remove_range(&mut txn, edit.pos, width);
            }
        }

        log::trace!("Applied {edit}");
        Ok(self.content.get_string(&txn))
    }

    fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }
}

/// Width in UTF-16 units of the character starting at `pos`.
///
/// `pos` must be below the text length.
fn unit_width_at(text: &str, pos: u32) -> Result<u32, MergeError> {
    let mut offset = 0u32;
    for ch in text.chars() {
        let width = ch.len_utf16() as u32;
        if offset == pos {
            return Ok(width);
        }
        if offset + width > pos {
            return Err(MergeError::SplitsCharacter { pos });
        }
        offset += width;
    }
    Err(MergeError::OutOfBounds { pos, len: offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_engine_is_empty() {
        let engine = TextMergeEngine::new();
        assert!(engine.is_empty());
        assert_eq!(engine.text(), "");
    }

    #[test]
    fn test_sequential_inserts() {
        let mut engine = TextMergeEngine::new();
        assert_eq!(engine.apply(&Edit::insert(0, 'h')).unwrap(), "h");
        assert_eq!(engine.apply(&Edit::insert(1, 'i')).unwrap(), "hi");
        assert_eq!(engine.apply(&Edit::insert(0, '>')).unwrap(), ">hi");
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_insert_in_middle() {
        let mut engine = TextMergeEngine::with_text("helo");
        assert_eq!(engine.apply(&Edit::insert(3, 'l')).unwrap(), "hello");
    }

    #[test]
    fn test_delete() {
        let mut engine = TextMergeEngine::with_text("hello");
        assert_eq!(engine.apply(&Edit::delete(0)).unwrap(), "ello");
        assert_eq!(engine.apply(&Edit::delete(3)).unwrap(), "ell");
    }

    #[test]
    fn test_insert_out_of_bounds_rejected() {
        let mut engine = TextMergeEngine::with_text("abc");
        let err = engine.apply(&Edit::insert(10, 'x')).unwrap_err();
        assert_eq!(err, MergeError::OutOfBounds { pos: 10, len: 3 });
        assert_eq!(engine.text(), "abc");
    }

    #[test]
    fn test_delete_out_of_bounds_rejected() {
        let mut engine = TextMergeEngine::with_text("abc");
        assert_eq!(
            engine.apply(&Edit::delete(3)).unwrap_err(),
            MergeError::OutOfBounds { pos: 3, len: 3 }
        );
        assert_eq!(engine.text(), "abc");
    }

    #[test]
    fn test_delete_from_empty_document() {
        let mut engine = TextMergeEngine::new();
        assert_eq!(
            engine.apply(&Edit::delete(0)).unwrap_err(),
            MergeError::EmptyDocument
        );
    }

    #[test]
    fn test_non_ascii_character() {
        let mut engine = TextMergeEngine::with_text("ab");
        assert_eq!(engine.apply(&Edit::insert(1, 'é')).unwrap(), "aéb");
        assert_eq!(engine.apply(&Edit::insert(3, 'c')).unwrap(), "aébc");
    }

    #[test]
    fn test_offsets_inside_surrogate_pair_rejected() {
        let mut engine = TextMergeEngine::with_text("a\u{1F600}b");
        assert_eq!(engine.len(), 4);

        assert_eq!(
            engine.apply(&Edit::delete(2)).unwrap_err(),
            MergeError::SplitsCharacter { pos: 2 }
        );
        assert_eq!(
            engine.apply(&Edit::insert(2, 'x')).unwrap_err(),
            MergeError::SplitsCharacter { pos: 2 }
        );
        assert_eq!(engine.text(), "a\u{1F600}b");
    }

    #[test]
    fn test_edits_around_surrogate_pair() {
        let mut engine = TextMergeEngine::with_text("a\u{1F600}b");
        assert_eq!(engine.apply(&Edit::insert(3, 'x')).unwrap(), "a\u{1F600}xb");
        assert_eq!(engine.apply(&Edit::insert(1, '<')).unwrap(), "a<\u{1F600}xb");

        // Delete at the high surrogate takes the whole character
        assert_eq!(engine.apply(&Edit::delete(2)).unwrap(), "a<xb");
        assert_eq!(engine.len(), 4);
    }

    #[test]
    fn test_insert_non_bmp_character() {
        let mut engine = TextMergeEngine::with_text("ab");
        assert_eq!(engine.apply(&Edit::insert(1, '\u{1F600}')).unwrap(), "a\u{1F600}b");
        assert_eq!(engine.len(), 4);
        assert_eq!(engine.apply(&Edit::insert(4, '!')).unwrap(), "a\u{1F600}b!");
    }

    #[test]
    fn test_engine_is_send() {
        fn assert_send<T: Send + 'static>() {}
        assert_send::<TextMergeEngine>();
    }
}
