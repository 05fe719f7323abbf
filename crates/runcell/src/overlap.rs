//! Keeps cells of different kernels on one buffer disjoint.

use crate::buffer::BufferHandle;
use crate::code_cell::CellId;
use crate::error::{KernelError, Result};
use crate::position::Point;
use crate::registry::SessionRegistry;
use crate::session::KernelState;

/// Delete every cell of a session other than `requesting` that intersects
/// `[begin, end]` on `buffer`.
///
/// If any such cell is still waiting for its reply the whole call is refused
/// with `OverlapConflict` and nothing is deleted. Returns how many cells were
/// removed.
pub fn try_delete_overlapping_cells(
    registry: &mut SessionRegistry,
    buffer: &BufferHandle,
    requesting: &str,
    begin: Point,
    end: Point,
) -> Result<usize> {
    let (begin, end) = {
        let buf = buffer.lock();
        (buf.clamp(begin), buf.clamp(end))
    };
    let buffer_id = buffer.id();

    let mut doomed: Vec<(String, Vec<CellId>)> = Vec::new();
    for kernel_id in registry.kernels_on(buffer_id) {
        if kernel_id == requesting {
            continue;
        }
        let session = registry.session(&kernel_id)?;
        let overlapping = session.cells_overlapping(buffer_id, begin, end);
        if overlapping.is_empty() {
            continue;
        }

        let busy = matches!(
            session.state(),
            KernelState::Executing | KernelState::Interrupting
        );
        if busy && overlapping.iter().any(|id| session.is_in_flight(*id)) {
            log::info!(
                "[registry] Refusing to replace running cell of {} on buffer {}",
                kernel_id,
                buffer_id
            );
            return Err(KernelError::OverlapConflict { kernel_id });
        }
        doomed.push((kernel_id, overlapping));
    }

    let mut deleted = 0;
    for (kernel_id, cells) in doomed {
        let session = registry.session_mut(&kernel_id)?;
        for id in cells {
            if session.delete_cell(id) {
                deleted += 1;
            }
        }
        log::debug!(
            "[registry] Deleted overlapping cells of {} on buffer {}",
            kernel_id,
            buffer_id
        );
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferId;
    use crate::session::tests::ready_session;
    use crate::settings::Settings;

    fn nine_lines() -> BufferHandle {
        BufferHandle::from_text(BufferId(3), "0\n1\n2\n3\n4\n5\n6\n7\n8")
    }

    fn registry_with_two(buf: &BufferHandle) -> SessionRegistry {
        let mut registry = SessionRegistry::new(Settings::default());
        let (a, _) = ready_session("a");
        let (b, _) = ready_session("b");
        registry.insert_session(buf, a).unwrap();
        registry.insert_session(buf, b).unwrap();
        registry
    }

    #[test]
    fn test_other_kernels_cell_is_replaced() {
        let buf = nine_lines();
        let mut registry = registry_with_two(&buf);

        // A defines [0, 5] and its reply has arrived (nothing in flight).
        let a_cell = registry.define_cell(&buf, Some("a"), 0, 5).unwrap();

        let deleted = try_delete_overlapping_cells(
            &mut registry,
            &buf,
            "b",
            Point::new(3, 0),
            Point::new(8, usize::MAX),
        )
        .unwrap();
        assert_eq!(deleted, 1);
        assert!(registry.session("a").unwrap().cell(a_cell).is_none());
    }

    #[test]
    fn test_requesting_kernel_and_disjoint_cells_are_untouched() {
        let buf = nine_lines();
        let mut registry = registry_with_two(&buf);
        registry.define_cell(&buf, Some("a"), 0, 2).unwrap();
        registry.define_cell(&buf, Some("b"), 3, 5).unwrap();

        let deleted = try_delete_overlapping_cells(
            &mut registry,
            &buf,
            "b",
            Point::new(3, 0),
            Point::new(5, usize::MAX),
        )
        .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(registry.session("a").unwrap().cell_count(), 1);
        assert_eq!(registry.session("b").unwrap().cell_count(), 1);
    }

    #[test]
    fn test_running_cell_refuses_and_changes_nothing() {
        let buf = nine_lines();
        let mut registry = SessionRegistry::new(Settings::default());
        let (a, _ha) = ready_session("a");
        let (b, _hb) = ready_session("b");
        let (c, _hc) = ready_session("c");
        registry.insert_session(&buf, a).unwrap();
        registry.insert_session(&buf, b).unwrap();
        registry.insert_session(&buf, c).unwrap();

        registry.define_cell(&buf, Some("a"), 4, 4).unwrap();
        registry
            .session_mut("b")
            .unwrap()
            .run_cell(&buf, Point::new(5, 0), Point::new(6, 1))
            .unwrap();

        let err = try_delete_overlapping_cells(
            &mut registry,
            &buf,
            "c",
            Point::new(0, 0),
            Point::new(8, 1),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::OverlapConflict { ref kernel_id } if kernel_id == "b"));
        assert_eq!(registry.session("a").unwrap().cell_count(), 1);
        assert_eq!(registry.session("b").unwrap().cell_count(), 1);
    }
}
