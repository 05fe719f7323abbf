//! Code cells: buffer regions bounded by two tracked positions.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferHandle, BufferId, MarkId};
use crate::error::{KernelError, Result};
use crate::position::{Anchor, Point, Position};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one cell instance. Two cells over the same text are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        CellId(NEXT_CELL_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell-{}", self.0)
    }
}

/// A position that lives in its buffer's mark table and follows edits.
///
/// The mark is released when the position is dropped.
#[derive(Debug)]
pub struct DynamicPosition {
    buffer: BufferHandle,
    mark: MarkId,
    anchor: Anchor,
}

impl DynamicPosition {
    pub fn new(buffer: &BufferHandle, point: Point, anchor: Anchor) -> Self {
        let mark = buffer.lock().set_mark(point, anchor);
        Self {
            buffer: buffer.clone(),
            mark,
            anchor,
        }
    }

    pub fn point(&self) -> Point {
        self.buffer.lock().mark(self.mark).unwrap_or_default()
    }

    pub fn position(&self) -> Position {
        let point = self.point();
        Position {
            buffer_id: self.buffer.id(),
            line: point.line,
            column: point.column,
            anchor: self.anchor,
        }
    }
}

impl Drop for DynamicPosition {
    fn drop(&mut self) {
        self.buffer.lock().remove_mark(self.mark);
    }
}

/// One execution unit: `[begin, end]` on a single buffer.
///
/// `begin` is left-anchored and `end` right-anchored, so text typed at the
/// end of the cell becomes part of it. Coordinates are always read from the
/// buffer, never cached.
#[derive(Debug)]
pub struct CodeCell {
    id: CellId,
    begin: DynamicPosition,
    end: DynamicPosition,
}

impl CodeCell {
    /// Place a cell on `buffer`. Both ends are clamped into the buffer first.
    pub fn new(buffer: &BufferHandle, begin: Point, end: Point) -> Result<Self> {
        let (begin, end) = {
            let buf = buffer.lock();
            (buf.clamp(begin), buf.clamp(end))
        };
        if begin > end {
            return Err(KernelError::InvalidSpan(format!(
                "begin {} is after end {}",
                begin, end
            )));
        }

        Ok(Self {
            id: CellId::next(),
            begin: DynamicPosition::new(buffer, begin, Anchor::Left),
            end: DynamicPosition::new(buffer, end, Anchor::Right),
        })
    }

    /// A cell covering whole lines `first..=last`.
    pub fn lines(buffer: &BufferHandle, first: usize, last: usize) -> Result<Self> {
        Self::new(buffer, Point::new(first, 0), Point::new(last, usize::MAX))
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.begin.buffer
    }

    pub fn buffer_id(&self) -> BufferId {
        self.begin.buffer.id()
    }

    pub fn begin(&self) -> Point {
        self.begin.point()
    }

    pub fn end(&self) -> Point {
        self.end.point()
    }

    pub fn begin_position(&self) -> Position {
        self.begin.position()
    }

    pub fn end_position(&self) -> Position {
        self.end.position()
    }

    /// Both ends, resolved under a single buffer lock.
    pub fn span(&self) -> (Point, Point) {
        let buf = self.buffer().lock();
        (
            buf.mark(self.begin.mark).unwrap_or_default(),
            buf.mark(self.end.mark).unwrap_or_default(),
        )
    }

    pub fn contains(&self, point: Point) -> bool {
        let (begin, end) = self.span();
        point.is_within(begin, end)
    }

    pub fn contains_position(&self, position: &Position) -> bool {
        position.buffer_id == self.buffer_id() && self.contains(position.point())
    }

    /// Inclusive range intersection on the same buffer.
    pub fn overlaps(&self, other: &CodeCell) -> bool {
        let (other_begin, other_end) = other.span();
        self.overlaps_span(other.buffer_id(), other_begin, other_end)
    }

    pub fn overlaps_span(&self, buffer: BufferId, begin: Point, end: Point) -> bool {
        if self.buffer_id() != buffer {
            return false;
        }
        let (own_begin, own_end) = self.span();
        own_begin <= end && begin <= own_end
    }

    /// Current text of the cell.
    pub fn text(&self) -> String {
        let buf = self.buffer().lock();
        let begin = buf.mark(self.begin.mark).unwrap_or_default();
        let end = buf.mark(self.end.mark).unwrap_or_default();
        buf.text_range(begin, end)
    }

    /// Order by live `begin`, then `end`.
    pub fn cmp_begin(&self, other: &CodeCell) -> Ordering {
        self.span().cmp(&other.span())
    }
}

impl PartialEq for CodeCell {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CodeCell {}

impl std::hash::Hash for CodeCell {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
