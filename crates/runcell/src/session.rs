//! One attached kernel: its cells, their outputs and the request routing.
//!
//! A session only mutates its maps on the command path (`run_code`,
//! `restart`, ...) and on the polling path (`tick`, `tick_input`). The
//! background channel tasks never see session state; they only fill queues.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferHandle, BufferId};
use crate::client::{ClientOptions, KernelClient};
use crate::code_cell::{CellId, CodeCell};
use crate::error::{KernelError, Result};
use crate::message::{KernelContent, KernelMessage};
use crate::output::{CellOutput, OutputChunk, OutputStatus};
use crate::position::{Point, Position};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    Uninitialized,
    Starting,
    Ready,
    Executing,
    Interrupting,
    Restarting,
    Deinitialized,
}

impl std::fmt::Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KernelState::Uninitialized => "uninitialized",
            KernelState::Starting => "starting",
            KernelState::Ready => "ready",
            KernelState::Executing => "executing",
            KernelState::Interrupting => "interrupting",
            KernelState::Restarting => "restarting",
            KernelState::Deinitialized => "deinitialized",
        };
        f.write_str(name)
    }
}

/// What a `tick` observed, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Output { cell: CellId, chunk: OutputChunk },
    Cleared { cell: CellId },
    ExecutionCount { cell: CellId, count: u64 },
    Done { cell: CellId, success: bool },
    StateChanged { from: KernelState, to: KernelState },
}

/// An `input_request` waiting for `send_stdin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPrompt {
    pub prompt: String,
    pub password: bool,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub tick_batch_size: usize,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub interrupt_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            tick_batch_size: settings.tick_batch_size.max(1),
            ready_timeout: settings.ready_timeout(),
            ready_poll_interval: settings.ready_poll_interval(),
            interrupt_timeout: settings.interrupt_timeout(),
        }
    }
}

#[derive(Debug)]
struct CellEntry {
    cell: CodeCell,
    output: CellOutput,
}

#[derive(Debug)]
pub struct KernelSession {
    kernel_id: String,
    client: KernelClient,
    state: KernelState,
    options: SessionOptions,
    buffers: Vec<BufferId>,
    cells: HashMap<CellId, CellEntry>,
    /// Requests whose `execute_reply` has not arrived yet.
    pending: HashMap<String, CellId>,
    /// Replied requests. Late iopub frames still route through here until the
    /// cell is run again or deleted.
    completed: HashMap<String, CellId>,
    kernel_status: Option<String>,
    interrupt_deadline: Option<Instant>,
    released: bool,
}

impl KernelSession {
    pub fn new(
        kernel_id: impl Into<String>,
        client: KernelClient,
        options: SessionOptions,
    ) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            client,
            state: KernelState::Uninitialized,
            options,
            buffers: Vec::new(),
            cells: HashMap::new(),
            pending: HashMap::new(),
            completed: HashMap::new(),
            kernel_status: None,
            interrupt_deadline: None,
            released: false,
        }
    }

    /// Build a client for `server_url` and wrap it in an uninitialized session.
    pub async fn connect(
        kernel_id: impl Into<String>,
        server_url: &str,
        kernel_name: &str,
        settings: &Settings,
    ) -> Result<Self> {
        let options = ClientOptions::from(settings);
        let client = KernelClient::connect(server_url, kernel_name, &options).await?;
        Ok(Self::new(kernel_id, client, SessionOptions::from(settings)))
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn kernel_name(&self) -> &str {
        self.client.kernel_name()
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Last `execution_state` the kernel reported on iopub.
    pub fn kernel_status(&self) -> Option<&str> {
        self.kernel_status.as_deref()
    }

    pub fn client(&self) -> &KernelClient {
        &self.client
    }

    fn set_state(&mut self, to: KernelState, events: &mut Vec<SessionEvent>) {
        if self.state != to {
            log::debug!(
                "[kernel-session] {}: {} -> {}",
                self.kernel_id,
                self.state,
                to
            );
            events.push(SessionEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    // Buffers

    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    pub fn attach_buffer(&mut self, buffer: BufferId) {
        if !self.buffers.contains(&buffer) {
            self.buffers.push(buffer);
        }
    }

    /// Returns true if no buffers remain attached.
    pub fn detach_buffer(&mut self, buffer: BufferId) -> bool {
        self.buffers.retain(|b| *b != buffer);
        self.buffers.is_empty()
    }

    // Lifecycle

    /// Start the kernel, open its channels and wait for it to go idle.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.state {
            KernelState::Uninitialized => {}
            KernelState::Deinitialized => {
                return Err(KernelError::KernelDead(self.kernel_id.clone()))
            }
            _ => return Ok(()),
        }

        self.state = KernelState::Starting;
        match self.start_kernel().await {
            Ok(()) => {
                self.state = KernelState::Ready;
                log::info!("[kernel-session] {} is ready", self.kernel_id);
                Ok(())
            }
            Err(e) => {
                log::error!("[kernel-session] Failed to start {}: {}", self.kernel_id, e);
                if let Err(shutdown_err) = self.client.shutdown().await {
                    log::warn!(
                        "[kernel-session] Cleanup after failed start of {} also failed: {}",
                        self.kernel_id,
                        shutdown_err
                    );
                }
                self.state = KernelState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn start_kernel(&mut self) -> Result<()> {
        self.client.start().await?;
        self.client.start_channels().await?;
        self.client
            .wait_for_ready(self.options.ready_timeout, self.options.ready_poll_interval)
            .await
    }

    /// POST an interrupt. Only meaningful while something is executing.
    pub async fn interrupt(&mut self) -> Result<()> {
        match self.state {
            KernelState::Executing => {}
            KernelState::Deinitialized => {
                return Err(KernelError::KernelDead(self.kernel_id.clone()))
            }
            other => {
                log::info!(
                    "[kernel-session] Ignoring interrupt of {} while {}",
                    self.kernel_id,
                    other
                );
                return Ok(());
            }
        }

        self.client.interrupt().await?;
        self.state = KernelState::Interrupting;
        self.interrupt_deadline = Some(Instant::now() + self.options.interrupt_timeout);
        Ok(())
    }

    /// Restart the kernel process, then wait for it to go idle again.
    ///
    /// In-flight requests are forgotten. With `delete_outputs` every cell is
    /// dropped, otherwise outputs are kept and marked stale.
    pub async fn restart(&mut self, delete_outputs: bool) -> Result<()> {
        match self.state {
            KernelState::Deinitialized => {
                return Err(KernelError::KernelDead(self.kernel_id.clone()))
            }
            KernelState::Uninitialized => {
                return Err(KernelError::KernelNotFound(format!(
                    "{} has not been started",
                    self.kernel_id
                )))
            }
            _ => {}
        }

        let previous = self.state;
        self.state = KernelState::Restarting;
        if let Err(e) = self.client.restart().await {
            self.state = previous;
            return Err(e);
        }

        self.pending.clear();
        self.completed.clear();
        self.interrupt_deadline = None;
        if delete_outputs {
            self.cells.clear();
        } else {
            for entry in self.cells.values_mut() {
                entry.output.stale = true;
                if entry.output.status != OutputStatus::Done {
                    entry.output.finish(false);
                }
            }
        }

        // A timeout leaves the session Starting; the next idle status seen by
        // `tick` completes the transition.
        self.state = KernelState::Starting;
        self.client
            .wait_for_ready(self.options.ready_timeout, self.options.ready_poll_interval)
            .await?;
        self.state = KernelState::Ready;
        log::info!("[kernel-session] {} restarted", self.kernel_id);
        Ok(())
    }

    /// Stop the receiver and delete the kernel. Safe to call more than once.
    pub async fn deinit(&mut self) -> Result<()> {
        self.state = KernelState::Deinitialized;
        self.pending.clear();
        self.interrupt_deadline = None;
        if self.released {
            return Ok(());
        }
        self.released = true;
        log::info!("[kernel-session] Deinitializing {}", self.kernel_id);
        self.client.shutdown().await
    }

    // Execution

    fn check_can_execute(&self) -> Result<()> {
        match self.state {
            KernelState::Ready | KernelState::Executing | KernelState::Interrupting => Ok(()),
            KernelState::Deinitialized => Err(KernelError::KernelDead(self.kernel_id.clone())),
            other => Err(KernelError::Connection(format!(
                "kernel '{}' is {}",
                self.kernel_id, other
            ))),
        }
    }

    /// Send `code` and track `cell` for it. A failed send tracks nothing.
    pub fn run_code(&mut self, code: &str, cell: CodeCell) -> Result<CellId> {
        self.check_can_execute()?;
        let msg_id = self.client.execute(code)?;
        Ok(self.track_new(cell, msg_id))
    }

    fn track_new(&mut self, cell: CodeCell, msg_id: String) -> CellId {
        let id = cell.id();
        self.cells.insert(
            id,
            CellEntry {
                cell,
                output: CellOutput::new(),
            },
        );
        self.track_request(id, msg_id);
        id
    }

    /// Run the text between `begin` and `end` as a cell of this session.
    ///
    /// This session's cells overlapping the span are dropped, except one with
    /// exactly the same span, which is re-run in place.
    pub fn run_cell(&mut self, buffer: &BufferHandle, begin: Point, end: Point) -> Result<CellId> {
        self.place_and_run(buffer, begin, end, None)
    }

    /// Run `expr` attached to a zero-width cell at the buffer origin.
    pub fn run_expression(&mut self, buffer: &BufferHandle, expr: &str) -> Result<CellId> {
        let origin = Point::new(0, 0);
        self.place_and_run(buffer, origin, origin, Some(expr))
    }

    fn place_and_run(
        &mut self,
        buffer: &BufferHandle,
        begin: Point,
        end: Point,
        code: Option<&str>,
    ) -> Result<CellId> {
        self.check_can_execute()?;
        let cell = CodeCell::new(buffer, begin, end)?;
        let span = cell.span();

        let mut reuse = None;
        let mut replaced = Vec::new();
        for id in self.overlapping_cells(&cell) {
            let same_span = self
                .cells
                .get(&id)
                .map(|entry| entry.cell.span() == span)
                .unwrap_or(false);
            if same_span && reuse.is_none() {
                reuse = Some(id);
            } else {
                replaced.push(id);
            }
        }

        // Nothing is dropped until the request is on its way.
        let code = match code {
            Some(code) => code.to_string(),
            None => cell.text(),
        };
        let msg_id = self.client.execute(&code)?;
        for id in replaced {
            self.delete_cell(id);
        }

        match reuse {
            Some(id) => {
                drop(cell);
                self.track_request(id, msg_id);
                Ok(id)
            }
            None => Ok(self.track_new(cell, msg_id)),
        }
    }

    /// Register a cell without running it.
    pub fn define_cell(&mut self, cell: CodeCell) -> CellId {
        let id = cell.id();
        self.cells.insert(
            id,
            CellEntry {
                cell,
                output: CellOutput::new(),
            },
        );
        id
    }

    /// Re-submit the current text of the cell containing `position`.
    pub fn reevaluate_cell(&mut self, position: &Position) -> Result<Option<CellId>> {
        self.check_can_execute()?;
        match self.cell_at(position) {
            Some(id) => {
                self.rerun(id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Re-submit every cell in ascending `begin` order.
    pub fn reevaluate_all(&mut self) -> Result<Vec<CellId>> {
        self.check_can_execute()?;
        let order = self.sorted_cell_ids(None);
        for id in &order {
            self.rerun(*id)?;
        }
        Ok(order)
    }

    fn rerun(&mut self, id: CellId) -> Result<()> {
        let code = self
            .cells
            .get(&id)
            .map(|entry| entry.cell.text())
            .ok_or_else(|| KernelError::InvalidSpan(format!("{} is not tracked", id)))?;
        self.submit(id, &code)
    }

    fn submit(&mut self, id: CellId, code: &str) -> Result<()> {
        let msg_id = self.client.execute(code)?;
        self.track_request(id, msg_id);
        Ok(())
    }

    /// Route `msg_id` to `id`, replacing whatever the cell was waiting on.
    fn track_request(&mut self, id: CellId, msg_id: String) {
        self.forget_requests(id);
        if let Some(entry) = self.cells.get_mut(&id) {
            entry.output.reset_for_run();
        }
        log::debug!(
            "[kernel-session] {} sent {} for {}",
            self.kernel_id,
            msg_id,
            id
        );
        self.pending.insert(msg_id, id);
        if self.state == KernelState::Ready {
            self.state = KernelState::Executing;
        }
    }

    fn forget_requests(&mut self, id: CellId) {
        self.pending.retain(|_, cell| *cell != id);
        self.completed.retain(|_, cell| *cell != id);
    }

    fn settle_if_idle(&mut self, events: &mut Vec<SessionEvent>) {
        if self.pending.is_empty()
            && matches!(self.state, KernelState::Executing | KernelState::Interrupting)
        {
            self.interrupt_deadline = None;
            self.set_state(KernelState::Ready, events);
        }
    }

    // Cells

    /// Drop a cell and its output. Returns false if it was not tracked here.
    pub fn delete_cell(&mut self, id: CellId) -> bool {
        let removed = self.cells.remove(&id).is_some();
        if removed {
            self.forget_requests(id);
            let mut events = Vec::new();
            self.settle_if_idle(&mut events);
        }
        removed
    }

    /// Drop every cell placed on `buffer`.
    pub fn clear_buffer(&mut self, buffer: BufferId) -> usize {
        let ids: Vec<CellId> = self
            .cells
            .iter()
            .filter(|(_, entry)| entry.cell.buffer_id() == buffer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.delete_cell(*id);
        }
        ids.len()
    }

    pub fn cell(&self, id: CellId) -> Option<&CodeCell> {
        self.cells.get(&id).map(|entry| &entry.cell)
    }

    pub fn output(&self, id: CellId) -> Option<&CellOutput> {
        self.cells.get(&id).map(|entry| &entry.output)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = (&CodeCell, &CellOutput)> {
        self.cells.values().map(|entry| (&entry.cell, &entry.output))
    }

    /// Cell ids ordered by live `begin`, optionally restricted to one buffer.
    pub fn sorted_cell_ids(&self, buffer: Option<BufferId>) -> Vec<CellId> {
        let mut entries: Vec<&CellEntry> = self
            .cells
            .values()
            .filter(|entry| buffer.map_or(true, |b| entry.cell.buffer_id() == b))
            .collect();
        entries.sort_by(|a, b| {
            a.cell
                .buffer_id()
                .cmp(&b.cell.buffer_id())
                .then_with(|| a.cell.cmp_begin(&b.cell))
        });
        entries.iter().map(|entry| entry.cell.id()).collect()
    }

    pub fn cell_at(&self, position: &Position) -> Option<CellId> {
        self.cells
            .values()
            .find(|entry| entry.cell.contains_position(position))
            .map(|entry| entry.cell.id())
    }

    /// Ids of this session's cells intersecting `cell`.
    pub fn overlapping_cells(&self, cell: &CodeCell) -> Vec<CellId> {
        let (begin, end) = cell.span();
        self.cells_overlapping(cell.buffer_id(), begin, end)
    }

    pub fn cells_overlapping(&self, buffer: BufferId, begin: Point, end: Point) -> Vec<CellId> {
        self.cells
            .values()
            .filter(|entry| entry.cell.overlaps_span(buffer, begin, end))
            .map(|entry| entry.cell.id())
            .collect()
    }

    /// True if `id` has a request the kernel has not answered yet.
    pub fn is_in_flight(&self, id: CellId) -> bool {
        self.pending.values().any(|cell| *cell == id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Track a cell with an output produced elsewhere, e.g. loaded from disk.
    pub fn restore_cell(&mut self, cell: CodeCell, output: CellOutput) -> CellId {
        let id = cell.id();
        self.cells.insert(id, CellEntry { cell, output });
        id
    }

    // Polling

    /// Drain up to `tick_batch_size` queued messages and route them to cells.
    ///
    /// Never blocks. An empty queue changes nothing and yields no events.
    pub fn tick(&mut self) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();
        if !self.client.has_channels() {
            return Ok(events);
        }
        self.check_interrupt_deadline(&mut events);

        for _ in 0..self.options.tick_batch_size {
            let frame = match self.client.get_iopub_msg() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(KernelError::KernelDead(reason)) => {
                    self.on_receiver_lost(&reason, &mut events);
                    break;
                }
                Err(e) => return Err(e),
            };

            match KernelMessage::from_json(frame) {
                Ok(message) => self.handle_message(message, &mut events),
                Err(e) => {
                    log::debug!("[kernel-session] {} skipping message: {}", self.kernel_id, e)
                }
            }
        }
        Ok(events)
    }

    fn check_interrupt_deadline(&mut self, events: &mut Vec<SessionEvent>) {
        if self.state != KernelState::Interrupting {
            return;
        }
        if let Some(deadline) = self.interrupt_deadline {
            if Instant::now() >= deadline {
                log::warn!(
                    "[kernel-session] No response to interrupt of {}, giving up waiting",
                    self.kernel_id
                );
                self.interrupt_deadline = None;
                let next = if self.pending.is_empty() {
                    KernelState::Ready
                } else {
                    KernelState::Executing
                };
                self.set_state(next, events);
            }
        }
    }

    fn on_receiver_lost(&mut self, reason: &str, events: &mut Vec<SessionEvent>) {
        log::warn!(
            "[kernel-session] Lost channels of {}: {}",
            self.kernel_id,
            reason
        );
        self.client.stop_channels();
        for (_, id) in self.pending.drain() {
            if let Some(entry) = self.cells.get_mut(&id) {
                entry.output.finish(false);
                events.push(SessionEvent::Done {
                    cell: id,
                    success: false,
                });
            }
        }
        self.interrupt_deadline = None;
        self.set_state(KernelState::Deinitialized, events);
    }

    fn handle_message(&mut self, message: KernelMessage, events: &mut Vec<SessionEvent>) {
        let routed = message.parent_msg_id.as_deref().and_then(|parent| {
            self.pending
                .get(parent)
                .or_else(|| self.completed.get(parent))
                .copied()
        });

        if let KernelContent::Status(status) = &message.content {
            let state = serde_json::to_value(&status.execution_state)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "unknown".to_string());
            self.on_status(&state, routed, events);
            return;
        }

        let Some(cell) = routed else {
            log::debug!(
                "[kernel-session] {} dropping unroutable {}",
                self.kernel_id,
                message.msg_type
            );
            return;
        };
        if !self.cells.contains_key(&cell) {
            log::debug!(
                "[kernel-session] {} no longer tracked, dropping {}",
                cell,
                message.msg_type
            );
            return;
        }

        match message.content {
            KernelContent::ExecuteReply(reply) => {
                if let Some(parent) = message.parent_msg_id {
                    if self.pending.remove(&parent).is_some() {
                        self.completed.insert(parent, cell);
                    }
                }
                let success = reply.is_ok();
                if let Some(entry) = self.cells.get_mut(&cell) {
                    if reply.execution_count.is_some() {
                        entry.output.execution_count = reply.execution_count;
                    }
                    entry.output.finish(success);
                    events.push(SessionEvent::Done {
                        cell,
                        success: entry.output.success,
                    });
                }
                if self.state == KernelState::Interrupting && !self.pending.is_empty() {
                    self.interrupt_deadline = None;
                    self.set_state(KernelState::Executing, events);
                }
                self.settle_if_idle(events);
            }
            KernelContent::ExecuteInput(input) => {
                let count = input.execution_count.0 as u64;
                if let Some(entry) = self.cells.get_mut(&cell) {
                    entry.output.execution_count = Some(count);
                    entry.output.set_running();
                }
                events.push(SessionEvent::ExecutionCount { cell, count });
            }
            KernelContent::ClearOutput(clear) => {
                if let Some(entry) = self.cells.get_mut(&cell) {
                    entry.output.clear(clear.wait);
                }
                if !clear.wait {
                    events.push(SessionEvent::Cleared { cell });
                }
            }
            content => {
                let Some(chunk) = OutputChunk::from_content(&content) else {
                    log::debug!(
                        "[kernel-session] {} ignoring {} on iopub",
                        self.kernel_id,
                        message.msg_type
                    );
                    return;
                };
                if let Some(entry) = self.cells.get_mut(&cell) {
                    if let OutputChunk::ExecuteResult {
                        execution_count: Some(count),
                        ..
                    } = &chunk
                    {
                        entry.output.execution_count = Some(*count);
                    }
                    entry.output.push(chunk.clone());
                }
                events.push(SessionEvent::Output { cell, chunk });
            }
        }
    }

    fn on_status(&mut self, state: &str, routed: Option<CellId>, events: &mut Vec<SessionEvent>) {
        self.kernel_status = Some(state.to_string());
        match state {
            "busy" => {
                if let Some(entry) = routed.and_then(|cell| self.cells.get_mut(&cell)) {
                    entry.output.set_running();
                }
            }
            "idle" => match self.state {
                KernelState::Interrupting => {
                    self.interrupt_deadline = None;
                    let next = if self.pending.is_empty() {
                        KernelState::Ready
                    } else {
                        KernelState::Executing
                    };
                    self.set_state(next, events);
                }
                KernelState::Starting => self.set_state(KernelState::Ready, events),
                _ => {}
            },
            _ => {}
        }
    }

    /// Poll the stdin queue for an `input_request`.
    pub fn tick_input(&mut self) -> Result<Option<InputPrompt>> {
        if !self.client.has_channels() {
            return Ok(None);
        }
        loop {
            let frame = match self.client.get_stdin_msg() {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(KernelError::KernelDead(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            match KernelMessage::from_json(frame) {
                Ok(KernelMessage {
                    content: KernelContent::InputRequest(request),
                    ..
                }) => {
                    return Ok(Some(InputPrompt {
                        prompt: request.prompt,
                        password: request.password,
                    }))
                }
                Ok(other) => log::debug!(
                    "[kernel-session] {} ignoring {} on stdin",
                    self.kernel_id,
                    other.msg_type
                ),
                Err(e) => log::debug!(
                    "[kernel-session] {} skipping stdin message: {}",
                    self.kernel_id,
                    e
                ),
            }
        }
    }

    /// Answer the last `input_request`.
    pub fn send_stdin(&mut self, text: &str) -> Result<()> {
        if self.state == KernelState::Deinitialized {
            return Err(KernelError::KernelDead(self.kernel_id.clone()));
        }
        self.client.send_input_reply(text)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channels::{ChannelHarness, KernelChannels};
    use serde_json::{json, Value};

    pub(crate) fn ready_session(kernel_id: &str) -> (KernelSession, ChannelHarness) {
        let (channels, harness) = KernelChannels::in_memory();
        let client = KernelClient::detached(kernel_id, channels);
        let mut session = KernelSession::new(kernel_id, client, SessionOptions::default());
        session.state = KernelState::Ready;
        (session, harness)
    }

    fn reply(parent: &str) -> Value {
        json!({
            "parent_header": {"msg_id": parent},
            "header": {"msg_type": "execute_reply"}
        })
    }

    fn stream(parent: &str, text: &str) -> Value {
        json!({
            "header": {"msg_type": "stream", "msg_id": "x"},
            "parent_header": {"msg_id": parent},
            "content": {"name": "stdout", "text": text},
            "channel": "iopub"
        })
    }

    fn sent_msg_id(harness: &mut ChannelHarness) -> String {
        harness.next_sent().unwrap()["header"]["msg_id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn buffer(text: &str) -> BufferHandle {
        BufferHandle::from_text(BufferId(1), text)
    }

    #[test]
    fn test_reply_routes_to_cell_and_clears_pending() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("x = 1");
        let cell = CodeCell::lines(&buf, 0, 0).unwrap();
        let id = session.run_code("x = 1", cell).unwrap();
        assert_eq!(session.state(), KernelState::Executing);

        let msg_id = sent_msg_id(&mut harness);
        assert!(session.is_in_flight(id));

        harness.push(reply(&msg_id));
        let events = session.tick().unwrap();

        assert_eq!(session.pending_count(), 0);
        assert!(events.contains(&SessionEvent::Done {
            cell: id,
            success: true
        }));
        assert_eq!(session.state(), KernelState::Ready);
        assert!(session.output(id).unwrap().is_done());
    }

    #[test]
    fn test_empty_tick_changes_nothing() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("print(1)");
        let id = session
            .run_code("print(1)", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        let _ = sent_msg_id(&mut harness);

        let before = session.output(id).unwrap().clone();
        let events = session.tick().unwrap();
        assert!(events.is_empty());
        assert_eq!(session.state(), KernelState::Executing);
        assert_eq!(session.pending_count(), 1);
        assert_eq!(session.output(id).unwrap(), &before);
    }

    #[test]
    fn test_stream_and_late_iopub_route_to_cell() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("print('a')");
        let id = session
            .run_code("print('a')", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        let msg_id = sent_msg_id(&mut harness);

        harness.push(stream(&msg_id, "a"));
        harness.push(reply(&msg_id));
        harness.push(stream(&msg_id, "b"));
        let events = session.tick().unwrap();

        assert_eq!(session.output(id).unwrap().text(), "ab");
        let outputs = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Output { .. }))
            .count();
        assert_eq!(outputs, 2);
    }

    #[test]
    fn test_rerun_forgets_old_requests() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("x");
        let id = session.run_cell(&buf, Point::new(0, 0), Point::new(0, 1)).unwrap();
        let first = sent_msg_id(&mut harness);
        harness.push(reply(&first));
        session.tick().unwrap();

        let again = session.run_cell(&buf, Point::new(0, 0), Point::new(0, 1)).unwrap();
        assert_eq!(again, id);
        let second = sent_msg_id(&mut harness);

        // Output from the previous run no longer lands in the cell.
        harness.push(stream(&first, "old"));
        harness.push(stream(&second, "new"));
        session.tick().unwrap();
        assert_eq!(session.output(id).unwrap().text(), "new");
    }

    #[test]
    fn test_run_cell_replaces_own_overlapping_cells() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("a\nb\nc\nd");
        let first = session.run_cell(&buf, Point::new(0, 0), Point::new(1, 1)).unwrap();
        let _ = sent_msg_id(&mut harness);
        let second = session.run_cell(&buf, Point::new(1, 0), Point::new(3, 1)).unwrap();

        assert_ne!(first, second);
        assert!(session.cell(first).is_none());
        assert_eq!(session.cell_count(), 1);
        assert!(!session.is_in_flight(first));
    }

    #[test]
    fn test_failed_send_keeps_existing_cells() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("a\nb\nc\nd");
        let first = session.run_cell(&buf, Point::new(0, 0), Point::new(1, 1)).unwrap();
        let msg_id = sent_msg_id(&mut harness);
        harness.push(stream(&msg_id, "kept"));
        harness.push(reply(&msg_id));
        session.tick().unwrap();

        session.client.stop_channels();

        // Overlapping span: nothing is replaced.
        let err = session
            .run_cell(&buf, Point::new(1, 0), Point::new(3, 1))
            .unwrap_err();
        assert!(matches!(err, KernelError::KernelDead(_)));
        assert!(session.cell(first).is_some());
        assert_eq!(session.cell_count(), 1);

        // Same span: the previous run's output and routing survive.
        let err = session
            .run_cell(&buf, Point::new(0, 0), Point::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, KernelError::KernelDead(_)));
        assert_eq!(session.output(first).unwrap().text(), "kept");
        assert!(session.completed.values().any(|cell| *cell == first));

        let err = session.rerun(first).unwrap_err();
        assert!(matches!(err, KernelError::KernelDead(_)));
        assert!(session.completed.values().any(|cell| *cell == first));
        assert_eq!(session.state(), KernelState::Ready);
    }

    #[test]
    fn test_error_output_and_execution_count() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("1/0");
        let id = session
            .run_code("1/0", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        let msg_id = sent_msg_id(&mut harness);

        harness.push(json!({
            "header": {"msg_type": "execute_input"},
            "parent_header": {"msg_id": msg_id},
            "content": {"code": "1/0", "execution_count": 7}
        }));
        harness.push(json!({
            "header": {"msg_type": "error"},
            "parent_header": {"msg_id": msg_id},
            "content": {"ename": "ZeroDivisionError", "evalue": "division by zero", "traceback": []}
        }));
        harness.push(json!({
            "header": {"msg_type": "execute_reply"},
            "parent_header": {"msg_id": msg_id},
            "content": {"status": "error", "execution_count": 7}
        }));
        let events = session.tick().unwrap();

        let output = session.output(id).unwrap();
        assert_eq!(output.execution_count, Some(7));
        assert!(!output.success);
        assert!(events.contains(&SessionEvent::ExecutionCount { cell: id, count: 7 }));
        assert!(events.contains(&SessionEvent::Done {
            cell: id,
            success: false
        }));
    }

    #[test]
    fn test_unknown_and_unroutable_messages_are_skipped() {
        let (mut session, mut harness) = ready_session("python3");
        harness.push(json!({"header": {"msg_type": "comm_msg"}, "content": {}}));
        harness.push(stream("nobody", "lost"));
        harness.push(json!({"not": "a message"}));
        let events = session.tick().unwrap();
        assert!(events.is_empty());
        assert_eq!(session.state(), KernelState::Ready);
    }

    #[test]
    fn test_tick_respects_batch_size() {
        let (mut session, harness) = ready_session("python3");
        session.options.tick_batch_size = 2;
        for _ in 0..5 {
            harness.push(json!({
                "header": {"msg_type": "status"},
                "content": {"execution_state": "busy"}
            }));
        }
        session.tick().unwrap();
        let mut remaining = 0;
        while let Ok(Some(_)) = session.client.get_iopub_msg() {
            remaining += 1;
        }
        assert_eq!(remaining, 3);
        assert_eq!(session.kernel_status(), Some("busy"));
    }

    #[test]
    fn test_lost_receiver_deinitializes() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("while True: pass");
        let id = session
            .run_code("while True: pass", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        harness.disconnect();

        let events = session.tick().unwrap();
        assert_eq!(session.state(), KernelState::Deinitialized);
        assert!(events.contains(&SessionEvent::Done {
            cell: id,
            success: false
        }));

        let err = session
            .run_code("1", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap_err();
        assert!(matches!(err, KernelError::KernelDead(_)));
    }

    #[test]
    fn test_clear_output_event() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("x");
        let id = session
            .run_code("x", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        let msg_id = sent_msg_id(&mut harness);
        harness.push(stream(&msg_id, "progress"));
        harness.push(json!({
            "header": {"msg_type": "clear_output"},
            "parent_header": {"msg_id": msg_id},
            "content": {"wait": false}
        }));
        let events = session.tick().unwrap();
        assert_eq!(events.last(), Some(&SessionEvent::Cleared { cell: id }));
        assert!(session.output(id).unwrap().chunks.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_outside_execution_is_a_no_op() {
        let (mut session, _harness) = ready_session("python3");
        session.interrupt().await.unwrap();
        assert_eq!(session.state(), KernelState::Ready);
    }

    #[test]
    fn test_interrupt_settles_on_idle_or_deadline() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("sleep");
        session
            .run_code("sleep", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        let _ = sent_msg_id(&mut harness);

        session.state = KernelState::Interrupting;
        session.interrupt_deadline = Some(Instant::now() + Duration::from_secs(60));
        harness.push(json!({
            "header": {"msg_type": "status"},
            "parent_header": {},
            "content": {"execution_state": "idle"}
        }));
        session.tick().unwrap();
        assert_eq!(session.state(), KernelState::Executing);

        session.state = KernelState::Interrupting;
        session.interrupt_deadline = Some(Instant::now());
        let events = session.tick().unwrap();
        assert_eq!(session.state(), KernelState::Executing);
        assert!(events.contains(&SessionEvent::StateChanged {
            from: KernelState::Interrupting,
            to: KernelState::Executing
        }));
    }

    #[test]
    fn test_stdin_round_trip() {
        let (mut session, mut harness) = ready_session("python3");
        assert_eq!(session.tick_input().unwrap(), None);

        harness.push(json!({
            "header": {"msg_type": "input_request"},
            "parent_header": {"msg_id": "m"},
            "content": {"prompt": "name? ", "password": false},
            "channel": "stdin"
        }));
        let prompt = session.tick_input().unwrap().unwrap();
        assert_eq!(prompt.prompt, "name? ");

        session.send_stdin("ada").unwrap();
        let sent = harness.next_sent().unwrap();
        assert_eq!(sent["channel"], "stdin");
        assert_eq!(sent["content"]["value"], "ada");
    }

    #[test]
    fn test_reevaluate_all_in_buffer_order() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("a = 1\nb = 2\nc = 3");
        let last = session.define_cell(CodeCell::lines(&buf, 2, 2).unwrap());
        let first = session.define_cell(CodeCell::lines(&buf, 0, 0).unwrap());

        let order = session.reevaluate_all().unwrap();
        assert_eq!(order, vec![first, last]);
        assert_eq!(harness.next_sent().unwrap()["content"]["code"], "a = 1");
        assert_eq!(harness.next_sent().unwrap()["content"]["code"], "c = 3");
        assert_eq!(session.pending_count(), 2);
    }

    #[test]
    fn test_reevaluate_cell_reads_current_text() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("x = 1");
        let id = session.define_cell(CodeCell::lines(&buf, 0, 0).unwrap());
        buf.lock().insert(Point::new(0, 5), "00");

        let position = session.cell(id).unwrap().begin_position();
        assert_eq!(session.reevaluate_cell(&position).unwrap(), Some(id));
        assert_eq!(harness.next_sent().unwrap()["content"]["code"], "x = 100");
    }

    #[test]
    fn test_delete_cell_settles_state() {
        let (mut session, mut harness) = ready_session("python3");
        let buf = buffer("x");
        let id = session
            .run_code("x", CodeCell::lines(&buf, 0, 0).unwrap())
            .unwrap();
        let _ = sent_msg_id(&mut harness);
        assert!(session.delete_cell(id));
        assert_eq!(session.state(), KernelState::Ready);
        assert_eq!(buf.lock().mark_count(), 0);
        assert!(!session.delete_cell(id));
    }

    #[test]
    fn test_clear_buffer_only_touches_that_buffer() {
        let (mut session, _harness) = ready_session("python3");
        let a = BufferHandle::from_text(BufferId(1), "a\nb");
        let b = BufferHandle::from_text(BufferId(2), "c");
        session.define_cell(CodeCell::lines(&a, 0, 0).unwrap());
        session.define_cell(CodeCell::lines(&a, 1, 1).unwrap());
        let kept = session.define_cell(CodeCell::lines(&b, 0, 0).unwrap());

        assert_eq!(session.clear_buffer(BufferId(1)), 2);
        assert_eq!(session.sorted_cell_ids(None), vec![kept]);
    }
}
