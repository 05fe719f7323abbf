//! Buffer coordinates and the edit-adjustment rules that keep them live.
//!
//! A tracked position is stored in its buffer's mark table (see `buffer.rs`)
//! and moved by every edit applied to that buffer. The rules are:
//!
//! - edits strictly after the position leave it alone
//! - edits ending at or before it shift it by the edit's net delta
//! - edits that swallow it clamp it to the edit's resulting boundary
//!
//! The [`Anchor`] decides what happens when text is inserted exactly at the
//! position: a right-anchored position is pushed past the new text, a
//! left-anchored one stays put.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferId;

/// A zero-based (line, column) coordinate. Columns are byte offsets.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Point {
    pub line: usize,
    pub column: usize,
}

impl Point {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// True if `begin <= self <= end`.
    pub fn is_within(&self, begin: Point, end: Point) -> bool {
        begin <= *self && *self <= end
    }

    /// Recompute this point after `edit` has been applied to the buffer.
    pub fn adjust(self, anchor: Anchor, edit: &TextEdit) -> Point {
        if self < edit.start {
            return self;
        }

        if self == edit.start && edit.is_insertion() {
            return match anchor {
                Anchor::Left => self,
                Anchor::Right => edit.new_end,
            };
        }

        if self < edit.old_end {
            return match anchor {
                Anchor::Left => edit.start,
                Anchor::Right => edit.new_end,
            };
        }

        if self.line == edit.old_end.line {
            Point {
                line: edit.new_end.line,
                column: edit.new_end.column + (self.column - edit.old_end.column),
            }
        } else {
            Point {
                line: self.line - edit.old_end.line + edit.new_end.line,
                column: self.column,
            }
        }
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Which side of an insertion a position sticks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    /// Stays before text inserted at its coordinate. Used for cell begins.
    Left,
    /// Moves after text inserted at its coordinate. Used for cell ends.
    Right,
}

/// A replacement of `[start, old_end)` by text that now spans `[start, new_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEdit {
    pub start: Point,
    pub old_end: Point,
    pub new_end: Point,
}

impl TextEdit {
    /// Nothing was removed, only inserted.
    pub fn is_insertion(&self) -> bool {
        self.start == self.old_end
    }
}

/// Snapshot of a tracked position, resolved against the live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub buffer_id: BufferId,
    pub line: usize,
    pub column: usize,
    pub anchor: Anchor,
}

impl Position {
    pub fn point(&self) -> Point {
        Point::new(self.line, self.column)
    }

    /// Order by coordinate only; positions in different buffers are unordered.
    pub fn partial_cmp_point(&self, other: &Position) -> Option<Ordering> {
        if self.buffer_id != other.buffer_id {
            return None;
        }
        Some(self.point().cmp(&other.point()))
    }
}
