//! Per-cell output records.
//!
//! Kernel content is converted into nbformat-shaped chunks so a record can be
//! persisted and handed to any notebook-aware renderer unchanged.

use jupyter_protocol::{DisplayData, ErrorOutput, ExecuteResult, Stdio, StreamContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::KernelContent;

/// One nbformat output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputChunk {
    Stream {
        name: String,
        text: String,
    },
    DisplayData {
        data: Value,
        #[serde(default)]
        metadata: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
    ExecuteResult {
        data: Value,
        #[serde(default)]
        metadata: Value,
        #[serde(default)]
        execution_count: Option<u64>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl OutputChunk {
    /// Convert displayable kernel content. Other content has no output form.
    pub fn from_content(content: &KernelContent) -> Option<Self> {
        match content {
            KernelContent::Stream(stream) => Some(stream_chunk(stream)),
            KernelContent::DisplayData(data) => Some(display_chunk(data)),
            KernelContent::ExecuteResult(result) => Some(result_chunk(result)),
            KernelContent::Error(error) => Some(error_chunk(error)),
            _ => None,
        }
    }

    /// Plain-text rendering, used by headless hosts.
    pub fn to_text(&self) -> String {
        match self {
            OutputChunk::Stream { text, .. } => text.clone(),
            OutputChunk::DisplayData { data, .. } | OutputChunk::ExecuteResult { data, .. } => {
                match data.get("text/plain") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => {
                        let mut mimes: Vec<&str> = data
                            .as_object()
                            .map(|m| m.keys().map(String::as_str).collect())
                            .unwrap_or_default();
                        mimes.sort_unstable();
                        format!("<{}>", mimes.join(", "))
                    }
                }
            }
            OutputChunk::Error {
                ename,
                evalue,
                traceback,
            } => {
                if traceback.is_empty() {
                    format!("{}: {}", ename, evalue)
                } else {
                    traceback.join("\n")
                }
            }
        }
    }
}

fn stream_chunk(stream: &StreamContent) -> OutputChunk {
    let name = match stream.name {
        Stdio::Stdout => "stdout",
        Stdio::Stderr => "stderr",
    };
    OutputChunk::Stream {
        name: name.to_string(),
        text: stream.text.clone(),
    }
}

fn display_chunk(data: &DisplayData) -> OutputChunk {
    OutputChunk::DisplayData {
        data: serde_json::to_value(&data.data).unwrap_or(Value::Null),
        metadata: serde_json::to_value(&data.metadata).unwrap_or(Value::Null),
        display_id: data
            .transient
            .as_ref()
            .and_then(|transient| transient.display_id.clone()),
    }
}

fn result_chunk(result: &ExecuteResult) -> OutputChunk {
    OutputChunk::ExecuteResult {
        data: serde_json::to_value(&result.data).unwrap_or(Value::Null),
        metadata: serde_json::to_value(&result.metadata).unwrap_or(Value::Null),
        execution_count: Some(result.execution_count.0 as u64),
    }
}

fn error_chunk(error: &ErrorOutput) -> OutputChunk {
    OutputChunk::Error {
        ename: error.ename.clone(),
        evalue: error.evalue.clone(),
        traceback: error.traceback.clone(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    /// Defined or queued, nothing sent back yet.
    #[default]
    Hold,
    Running,
    Done,
}

/// Everything a cell has produced since it was last run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    pub execution_count: Option<u64>,
    pub status: OutputStatus,
    pub success: bool,
    /// The kernel restarted since these outputs were produced.
    #[serde(default)]
    pub stale: bool,
    pub chunks: Vec<OutputChunk>,
    #[serde(skip)]
    clear_on_next: bool,
}

impl CellOutput {
    pub fn new() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// Reset for a fresh run of the cell.
    pub fn reset_for_run(&mut self) {
        *self = Self::new();
    }

    pub fn set_running(&mut self) {
        if self.status == OutputStatus::Hold {
            self.status = OutputStatus::Running;
        }
    }

    pub fn finish(&mut self, success: bool) {
        self.status = OutputStatus::Done;
        self.success = self.success && success;
    }

    /// Append a chunk. Consecutive streams of the same name are merged.
    pub fn push(&mut self, chunk: OutputChunk) {
        if self.clear_on_next {
            self.chunks.clear();
            self.clear_on_next = false;
        }
        if matches!(chunk, OutputChunk::Error { .. }) {
            self.success = false;
        }
        self.set_running();

        if let (
            Some(OutputChunk::Stream { name, text }),
            OutputChunk::Stream {
                name: new_name,
                text: new_text,
            },
        ) = (self.chunks.last_mut(), &chunk)
        {
            if name == new_name {
                text.push_str(new_text);
                return;
            }
        }
        self.chunks.push(chunk);
    }

    /// `clear_output`: with `wait` the clear is deferred to the next chunk.
    pub fn clear(&mut self, wait: bool) {
        if wait {
            self.clear_on_next = true;
        } else {
            self.chunks.clear();
            self.clear_on_next = false;
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == OutputStatus::Done
    }

    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(OutputChunk::to_text)
            .collect::<Vec<_>>()
            .join("")
    }
}
