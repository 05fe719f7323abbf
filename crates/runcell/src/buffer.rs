//! In-memory text buffer with an edit-tracked mark table.
//!
//! The host owns its buffers and applies every edit through [`Buffer::set_text`]
//! (or the line helpers built on it). Each edit is reported to all marks so
//! the positions held by code cells follow the text they were placed on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::position::{Anchor, Point, TextEdit};

/// Host-assigned buffer number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkId(u64);

#[derive(Debug, Clone, Copy)]
struct Mark {
    point: Point,
    anchor: Anchor,
}

#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    lines: Vec<String>,
    marks: HashMap<MarkId, Mark>,
    next_mark: u64,
}

impl Buffer {
    pub fn new(id: BufferId, text: &str) -> Self {
        Self {
            id,
            lines: text.split('\n').map(String::from).collect(),
            marks: HashMap::new(),
            next_mark: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, line: usize) -> Option<&str> {
        self.lines.get(line).map(String::as_str)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Last valid coordinate in the buffer.
    pub fn end_point(&self) -> Point {
        let line = self.lines.len() - 1;
        Point::new(line, self.lines[line].len())
    }

    /// Clamp `point` into the buffer, snapping columns to a char boundary.
    pub fn clamp(&self, point: Point) -> Point {
        let line = point.line.min(self.lines.len() - 1);
        let text = &self.lines[line];
        let mut column = point.column.min(text.len());
        while !text.is_char_boundary(column) {
            column -= 1;
        }
        Point::new(line, column)
    }

    /// Text between `begin` and `end`: lines inclusive, end column exclusive.
    pub fn text_range(&self, begin: Point, end: Point) -> String {
        let begin = self.clamp(begin);
        let end = self.clamp(end);
        if begin > end {
            return String::new();
        }
        if begin.line == end.line {
            return self.lines[begin.line][begin.column..end.column].to_string();
        }

        let mut parts = Vec::with_capacity(end.line - begin.line + 1);
        parts.push(&self.lines[begin.line][begin.column..]);
        for line in &self.lines[begin.line + 1..end.line] {
            parts.push(line.as_str());
        }
        parts.push(&self.lines[end.line][..end.column]);
        parts.join("\n")
    }

    /// Replace `[start, end)` with `replacement` and move every mark.
    pub fn set_text(&mut self, start: Point, end: Point, replacement: &str) -> TextEdit {
        let mut start = self.clamp(start);
        let mut end = self.clamp(end);
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }

        let prefix = self.lines[start.line][..start.column].to_string();
        let suffix = self.lines[end.line][end.column..].to_string();

        let parts: Vec<&str> = replacement.split('\n').collect();
        let last = parts.len() - 1;
        let new_end = if last == 0 {
            Point::new(start.line, start.column + parts[0].len())
        } else {
            Point::new(start.line + last, parts[last].len())
        };

        let mut new_lines = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let mut line = String::new();
            if i == 0 {
                line.push_str(&prefix);
            }
            line.push_str(part);
            if i == last {
                line.push_str(&suffix);
            }
            new_lines.push(line);
        }
        self.lines.splice(start.line..=end.line, new_lines);

        let edit = TextEdit {
            start,
            old_end: end,
            new_end,
        };
        for mark in self.marks.values_mut() {
            mark.point = mark.point.adjust(mark.anchor, &edit);
        }
        edit
    }

    pub fn insert(&mut self, at: Point, text: &str) -> TextEdit {
        self.set_text(at, at, text)
    }

    /// Insert whole lines before `line`; appends when `line` is past the end.
    pub fn insert_lines(&mut self, line: usize, lines: &[&str]) -> TextEdit {
        let joined = lines.join("\n");
        if line < self.lines.len() {
            self.insert(Point::new(line, 0), &format!("{}\n", joined))
        } else {
            let end = self.end_point();
            self.insert(end, &format!("\n{}", joined))
        }
    }

    /// Delete lines `first..last` (exclusive).
    pub fn delete_lines(&mut self, first: usize, last: usize) -> Option<TextEdit> {
        if first >= last || first >= self.lines.len() {
            return None;
        }
        let edit = if last < self.lines.len() {
            self.set_text(Point::new(first, 0), Point::new(last, 0), "")
        } else if first > 0 {
            let from = Point::new(first - 1, self.lines[first - 1].len());
            let end = self.end_point();
            self.set_text(from, end, "")
        } else {
            let end = self.end_point();
            self.set_text(Point::new(0, 0), end, "")
        };
        Some(edit)
    }

    pub(crate) fn set_mark(&mut self, point: Point, anchor: Anchor) -> MarkId {
        let id = MarkId(self.next_mark);
        self.next_mark += 1;
        let point = self.clamp(point);
        self.marks.insert(id, Mark { point, anchor });
        id
    }

    pub(crate) fn mark(&self, id: MarkId) -> Option<Point> {
        self.marks.get(&id).map(|m| self.clamp(m.point))
    }

    pub(crate) fn remove_mark(&mut self, id: MarkId) {
        self.marks.remove(&id);
    }

    /// Number of live marks. Marks are released when their cell is dropped.
    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }
}

/// Shared handle to a host buffer, cloned into every cell placed on it.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    id: BufferId,
    inner: Arc<StdMutex<Buffer>>,
}

impl BufferHandle {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            id: buffer.id(),
            inner: Arc::new(StdMutex::new(buffer)),
        }
    }

    pub fn from_text(id: BufferId, text: &str) -> Self {
        Self::new(Buffer::new(id, text))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
