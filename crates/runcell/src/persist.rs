//! Saving a session's cells and outputs for one buffer, and loading them back.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::{BufferHandle, BufferId};
use crate::code_cell::{CellId, CodeCell};
use crate::error::{KernelError, Result};
use crate::output::{CellOutput, OutputStatus};
use crate::position::Point;
use crate::session::KernelSession;

pub const SESSION_DATA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub version: u64,
    /// Kernel name to start when loading.
    pub kernel: String,
    pub cells: Vec<CellData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellData {
    pub begin: Point,
    pub end: Point,
    pub code: String,
    pub outputs: CellOutput,
}

impl SessionData {
    /// Validate the envelope before deserializing the rest.
    pub fn from_value(value: Value) -> Result<Self> {
        match value.get("version") {
            Some(Value::Number(n)) if n.as_u64() == Some(SESSION_DATA_VERSION) => {}
            Some(Value::Number(n)) => {
                return Err(KernelError::InvalidSessionData(format!("bad version: {}", n)))
            }
            Some(_) => {
                return Err(KernelError::InvalidSessionData(
                    "'version' must be an integer".into(),
                ))
            }
            None => return Err(KernelError::InvalidSessionData("missing 'version'".into())),
        }
        if !value.get("kernel").is_some_and(Value::is_string) {
            return Err(KernelError::InvalidSessionData(
                "missing or non-string 'kernel'".into(),
            ));
        }
        serde_json::from_value(value).map_err(|e| KernelError::InvalidSessionData(e.to_string()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| KernelError::InvalidSessionData(format!("{}: {}", path.display(), e)))?;
        Self::from_value(value)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Snapshot every cell `session` has on `buffer`, in buffer order.
pub fn save(session: &KernelSession, buffer: BufferId) -> SessionData {
    let cells = session
        .sorted_cell_ids(Some(buffer))
        .into_iter()
        .filter_map(|id| {
            let cell = session.cell(id)?;
            let output = session.output(id)?;
            let (begin, end) = cell.span();
            Some(CellData {
                begin,
                end,
                code: cell.text(),
                outputs: output.clone(),
            })
        })
        .collect();

    SessionData {
        version: SESSION_DATA_VERSION,
        kernel: session.kernel_name().to_string(),
        cells,
    }
}

/// Recreate the saved cells on `buffer` with their outputs.
///
/// Outputs that were still running when saved are closed as failed.
pub fn load(
    session: &mut KernelSession,
    buffer: &BufferHandle,
    data: &SessionData,
) -> Result<Vec<CellId>> {
    let mut restored = Vec::with_capacity(data.cells.len());
    for saved in &data.cells {
        let cell = CodeCell::new(buffer, saved.begin, saved.end)?;
        if cell.text() != saved.code {
            log::debug!(
                "[registry] Text of saved cell at {} changed since it was saved",
                saved.begin
            );
        }
        let mut output = saved.outputs.clone();
        if output.status != OutputStatus::Done {
            output.finish(false);
        }
        restored.push(session.restore_cell(cell, output));
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputChunk;
    use crate::session::tests::ready_session;
    use serde_json::json;

    #[test]
    fn test_version_is_checked() {
        let err = SessionData::from_value(json!({"version": 2, "kernel": "python3", "cells": []}))
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidSessionData(ref m) if m.contains("bad version")));

        let err = SessionData::from_value(json!({"kernel": "python3", "cells": []})).unwrap_err();
        assert!(matches!(err, KernelError::InvalidSessionData(_)));

        let err =
            SessionData::from_value(json!({"version": 1, "kernel": 3, "cells": []})).unwrap_err();
        assert!(matches!(err, KernelError::InvalidSessionData(_)));
    }

    #[test]
    fn test_save_then_load_into_fresh_buffer() {
        let buf = BufferHandle::from_text(BufferId(1), "a = 1\nprint(a)\nb = 2");
        let (mut session, _harness) = ready_session("python3");
        session.define_cell(CodeCell::lines(&buf, 2, 2).unwrap());
        let mut output = CellOutput::new();
        output.push(OutputChunk::Stream {
            name: "stdout".into(),
            text: "1\n".into(),
        });
        output.finish(true);
        session.restore_cell(CodeCell::lines(&buf, 0, 1).unwrap(), output);

        let data = save(&session, BufferId(1));
        assert_eq!(data.version, 1);
        assert_eq!(data.kernel, "python3");
        assert_eq!(data.cells.len(), 2);
        assert_eq!(data.cells[0].code, "a = 1\nprint(a)");
        assert_eq!(data.cells[1].begin, Point::new(2, 0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        data.write(&path).unwrap();
        let loaded = SessionData::read(&path).unwrap();
        assert_eq!(loaded, data);

        let fresh = BufferHandle::from_text(BufferId(2), "a = 1\nprint(a)\nb = 2");
        let (mut other, _h) = ready_session("python3");
        let ids = load(&mut other, &fresh, &loaded).unwrap();
        assert_eq!(ids.len(), 2);
        let output = other.output(ids[0]).unwrap();
        assert_eq!(output.text(), "1\n");
        assert!(output.success);
        // The second cell was never run, so it is closed as failed.
        assert!(other.output(ids[1]).unwrap().is_done());
        assert_eq!(other.cell(ids[0]).unwrap().text(), "a = 1\nprint(a)");
    }

    #[test]
    fn test_read_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            SessionData::read(&path),
            Err(KernelError::InvalidSessionData(_))
        ));
        assert!(matches!(
            SessionData::read(&dir.path().join("missing.json")),
            Err(KernelError::Io(_))
        ));
    }
}
