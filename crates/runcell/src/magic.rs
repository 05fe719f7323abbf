//! `#%%`-delimited cells.
//!
//! A magic cell starts at a marker line and runs until the line before the
//! next marker, or the end of the buffer. The marker line itself is not code.

use crate::buffer::Buffer;
use crate::position::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicCell {
    pub marker_line: usize,
    pub last_line: usize,
}

impl MagicCell {
    /// The code lines below the marker, if there are any.
    pub fn code_span(&self) -> Option<(Point, Point)> {
        let first = self.marker_line + 1;
        if first > self.last_line {
            return None;
        }
        Some((Point::new(first, 0), Point::new(self.last_line, usize::MAX)))
    }

    pub fn contains_line(&self, line: usize) -> bool {
        self.marker_line <= line && line <= self.last_line
    }
}

fn is_marker(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("#%%") || line.starts_with("# %%")
}

/// Every magic cell in `buffer`, top to bottom.
pub fn find_magic_cells(buffer: &Buffer) -> Vec<MagicCell> {
    let markers: Vec<usize> = (0..buffer.line_count())
        .filter(|&i| buffer.line(i).is_some_and(is_marker))
        .collect();

    markers
        .iter()
        .enumerate()
        .map(|(i, &marker_line)| MagicCell {
            marker_line,
            last_line: markers
                .get(i + 1)
                .map(|next| next - 1)
                .unwrap_or(buffer.line_count() - 1),
        })
        .collect()
}

pub fn magic_cell_at(buffer: &Buffer, line: usize) -> Option<MagicCell> {
    find_magic_cells(buffer)
        .into_iter()
        .find(|cell| cell.contains_line(line))
}

/// First cell whose marker is below `line`, wrapping to the first cell.
pub fn next_magic_cell(buffer: &Buffer, line: usize) -> Option<MagicCell> {
    let cells = find_magic_cells(buffer);
    cells
        .iter()
        .find(|cell| cell.marker_line > line)
        .or_else(|| cells.first())
        .copied()
}

/// Last cell whose marker is above `line`, wrapping to the last cell.
pub fn prev_magic_cell(buffer: &Buffer, line: usize) -> Option<MagicCell> {
    let cells = find_magic_cells(buffer);
    cells
        .iter()
        .rev()
        .find(|cell| cell.marker_line < line)
        .or_else(|| cells.last())
        .copied()
}
