//! Buffers, the kernels attached to them, and the commands that span both.
//!
//! The registry is an ordinary value owned by the host. A kernel id is unique
//! within it; one session may be attached to several buffers (a shared
//! kernel) and one buffer may have several sessions attached.

use std::collections::HashMap;

use crate::buffer::{BufferHandle, BufferId};
use crate::code_cell::{CellId, CodeCell};
use crate::error::{KernelError, Result};
use crate::magic;
use crate::output::CellOutput;
use crate::overlap::try_delete_overlapping_cells;
use crate::persist::{self, SessionData};
use crate::position::{Point, Position};
use crate::session::{InputPrompt, KernelSession, SessionEvent};
use crate::settings::{AutoInit, Settings};

#[derive(Debug)]
struct AttachedBuffer {
    handle: BufferHandle,
    /// Attach order.
    kernels: Vec<String>,
}

/// One cell as seen across every kernel on a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRef {
    pub kernel_id: String,
    pub cell: CellId,
    pub begin: Point,
    pub end: Point,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    settings: Settings,
    buffers: HashMap<BufferId, AttachedBuffer>,
    sessions: HashMap<String, KernelSession>,
}

impl SessionRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            buffers: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // Lookups

    pub fn session(&self, kernel_id: &str) -> Result<&KernelSession> {
        self.sessions
            .get(kernel_id)
            .ok_or_else(|| KernelError::KernelNotFound(kernel_id.to_string()))
    }

    pub fn session_mut(&mut self, kernel_id: &str) -> Result<&mut KernelSession> {
        self.sessions
            .get_mut(kernel_id)
            .ok_or_else(|| KernelError::KernelNotFound(kernel_id.to_string()))
    }

    pub fn buffer(&self, buffer: BufferId) -> Result<&BufferHandle> {
        self.buffers
            .get(&buffer)
            .map(|attached| &attached.handle)
            .ok_or(KernelError::NotAttached(buffer))
    }

    /// Kernel ids attached to `buffer`, in attach order.
    pub fn kernels_on(&self, buffer: BufferId) -> Vec<String> {
        self.buffers
            .get(&buffer)
            .map(|attached| attached.kernels.clone())
            .unwrap_or_default()
    }

    pub fn is_attached(&self, buffer: BufferId) -> bool {
        self.buffers.contains_key(&buffer)
    }

    /// Kernel ids attached to `buffer`, or every kernel id, sorted.
    pub fn running_kernels(&self, buffer: Option<BufferId>) -> Vec<String> {
        let mut ids = match buffer {
            Some(buffer) => self.kernels_on(buffer),
            None => self.sessions.keys().cloned().collect(),
        };
        ids.sort();
        ids
    }

    /// `kernel_name`, or `kernel_name_<n>` if that id is already taken.
    pub fn unique_kernel_id(&self, kernel_name: &str) -> String {
        if !self.sessions.contains_key(kernel_name) {
            return kernel_name.to_string();
        }
        let mut n = self.sessions.len();
        loop {
            let candidate = format!("{}_{}", kernel_name, n);
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn resolve_kernel(&self, buffer: BufferId, kernel: Option<&str>) -> Result<String> {
        let attached = self.kernels_on(buffer);
        if attached.is_empty() {
            return Err(KernelError::NotAttached(buffer));
        }
        match kernel {
            Some(kernel) if attached.iter().any(|k| k == kernel) => Ok(kernel.to_string()),
            Some(kernel) => Err(KernelError::KernelNotFound(format!(
                "{} is not attached to buffer {}",
                kernel, buffer
            ))),
            None => match attached.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(KernelError::KernelNotFound(format!(
                    "buffer {} has {} kernels attached; name one",
                    buffer,
                    attached.len()
                ))),
            },
        }
    }

    // Attaching

    fn attach(&mut self, buffer: &BufferHandle, kernel_id: &str) {
        let attached = self
            .buffers
            .entry(buffer.id())
            .or_insert_with(|| AttachedBuffer {
                handle: buffer.clone(),
                kernels: Vec::new(),
            });
        if !attached.kernels.iter().any(|k| k == kernel_id) {
            attached.kernels.push(kernel_id.to_string());
        }
        if let Some(session) = self.sessions.get_mut(kernel_id) {
            session.attach_buffer(buffer.id());
        }
    }

    /// Register an already constructed session and attach it to `buffer`.
    pub fn insert_session(
        &mut self,
        buffer: &BufferHandle,
        session: KernelSession,
    ) -> Result<String> {
        let kernel_id = session.kernel_id().to_string();
        if self.sessions.contains_key(&kernel_id) {
            return Err(KernelError::InvalidSessionData(format!(
                "kernel id '{}' is already registered",
                kernel_id
            )));
        }
        self.sessions.insert(kernel_id.clone(), session);
        self.attach(buffer, &kernel_id);
        log::info!("[registry] Attached {} to buffer {}", kernel_id, buffer.id());
        Ok(kernel_id)
    }

    /// Start a kernel on `server_url` and attach it to `buffer`.
    ///
    /// With `shared`, an already running session named `kernel_name` is
    /// attached instead; if there is none a new kernel is started.
    pub async fn initialize_buffer(
        &mut self,
        buffer: &BufferHandle,
        server_url: &str,
        kernel_name: &str,
        shared: bool,
    ) -> Result<String> {
        if shared {
            if self.sessions.contains_key(kernel_name) {
                self.attach_shared(buffer, kernel_name)?;
                return Ok(kernel_name.to_string());
            }
            log::warn!(
                "[registry] No running kernel {} to share, starting a new one",
                kernel_name
            );
        }

        let kernel_id = self.unique_kernel_id(kernel_name);
        let mut session =
            KernelSession::connect(kernel_id.clone(), server_url, kernel_name, &self.settings)
                .await?;
        session.initialize().await?;
        self.insert_session(buffer, session)
    }

    /// Attach the running session `kernel_id` to another buffer.
    pub fn attach_shared(&mut self, buffer: &BufferHandle, kernel_id: &str) -> Result<()> {
        self.session(kernel_id)?;
        self.attach(buffer, kernel_id);
        log::info!("[registry] Shared {} with buffer {}", kernel_id, buffer.id());
        Ok(())
    }

    // Tearing down

    async fn deinit_kernels(&mut self, kernel_ids: Vec<String>) -> Result<()> {
        let mut first_error = None;
        for kernel_id in kernel_ids {
            let Some(mut session) = self.sessions.remove(&kernel_id) else {
                continue;
            };
            if let Err(e) = session.deinit().await {
                log::warn!("[registry] Deinit of {} failed: {}", kernel_id, e);
                first_error.get_or_insert(e);
            }
            for buffer in session.buffers().to_vec() {
                if let Some(attached) = self.buffers.get_mut(&buffer) {
                    attached.kernels.retain(|k| *k != kernel_id);
                    if attached.kernels.is_empty() {
                        self.buffers.remove(&buffer);
                    }
                }
            }
            // Cells release their buffer marks here, with no buffer lock held.
            drop(session);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deinit every kernel attached to `buffer`, detaching each from all of
    /// its buffers.
    pub async fn deinit_buffer(&mut self, buffer: BufferId) -> Result<()> {
        if !self.is_attached(buffer) {
            return Err(KernelError::NotAttached(buffer));
        }
        let kernels = self.kernels_on(buffer);
        self.deinit_kernels(kernels).await
    }

    /// The host unloaded `buffer`. Unattached buffers are ignored.
    pub async fn on_buffer_unload(&mut self, buffer: BufferId) -> Result<()> {
        if !self.is_attached(buffer) {
            return Ok(());
        }
        self.deinit_buffer(buffer).await
    }

    /// Deinit everything, e.g. when the host exits.
    pub async fn deinitialize_all(&mut self) -> Result<()> {
        let kernels: Vec<String> = self.sessions.keys().cloned().collect();
        self.deinit_kernels(kernels).await
    }

    // Executing

    async fn session_for_evaluation(
        &mut self,
        buffer: &BufferHandle,
        kernel: Option<&str>,
    ) -> Result<String> {
        match self.resolve_kernel(buffer.id(), kernel) {
            Err(KernelError::NotAttached(id)) if self.settings.auto_init == AutoInit::Init => {
                let server_url = self
                    .settings
                    .server_url
                    .clone()
                    .ok_or(KernelError::NotAttached(id))?;
                let kernel_name = kernel.unwrap_or("python3").to_string();
                log::info!(
                    "[registry] Buffer {} has no kernel, starting {}",
                    id,
                    kernel_name
                );
                self.initialize_buffer(buffer, &server_url, &kernel_name, false)
                    .await
            }
            other => other,
        }
    }

    /// Run `[begin, end]` of `buffer` on `kernel`.
    ///
    /// Overlapping cells of other kernels are deleted first; if one of them is
    /// still running nothing happens and `OverlapConflict` is returned.
    pub async fn evaluate(
        &mut self,
        buffer: &BufferHandle,
        kernel: Option<&str>,
        begin: Point,
        end: Point,
    ) -> Result<CellId> {
        let kernel_id = self.session_for_evaluation(buffer, kernel).await?;
        try_delete_overlapping_cells(self, buffer, &kernel_id, begin, end)?;
        self.session_mut(&kernel_id)?.run_cell(buffer, begin, end)
    }

    /// Run `expr` on `kernel`, attached to a zero-width cell at the buffer origin.
    pub async fn evaluate_expression(
        &mut self,
        buffer: &BufferHandle,
        kernel: Option<&str>,
        expr: &str,
    ) -> Result<CellId> {
        let kernel_id = self.session_for_evaluation(buffer, kernel).await?;
        let origin = Point::new(0, 0);
        try_delete_overlapping_cells(self, buffer, &kernel_id, origin, origin)?;
        self.session_mut(&kernel_id)?.run_expression(buffer, expr)
    }

    /// Run the `#%%` cell containing `line`. `None` if `line` is in no magic
    /// cell or the cell has no code below its marker.
    pub async fn evaluate_magic_cell(
        &mut self,
        buffer: &BufferHandle,
        kernel: Option<&str>,
        line: usize,
    ) -> Result<Option<CellId>> {
        let span = {
            let buf = buffer.lock();
            magic::magic_cell_at(&buf, line).and_then(|cell| cell.code_span())
        };
        match span {
            Some((begin, end)) => self.evaluate(buffer, kernel, begin, end).await.map(Some),
            None => Ok(None),
        }
    }

    /// Track whole lines `first..=last` as a cell of `kernel` without running it.
    ///
    /// Other kernels' cells under those lines are deleted first, unless one of
    /// them is still running.
    pub fn define_cell(
        &mut self,
        buffer: &BufferHandle,
        kernel: Option<&str>,
        first_line: usize,
        last_line: usize,
    ) -> Result<CellId> {
        let kernel_id = self.resolve_kernel(buffer.id(), kernel)?;
        let cell = CodeCell::lines(buffer, first_line, last_line)?;
        let (begin, end) = cell.span();
        try_delete_overlapping_cells(self, buffer, &kernel_id, begin, end)?;
        Ok(self.session_mut(&kernel_id)?.define_cell(cell))
    }

    /// Re-run the cell under `position`, whichever kernel owns it.
    pub fn reevaluate_cell(&mut self, position: &Position) -> Result<Option<CellId>> {
        match self.cell_at(position) {
            Some(found) => self.session_mut(&found.kernel_id)?.reevaluate_cell(position),
            None => Ok(None),
        }
    }

    /// Re-run every cell of every kernel on `buffer`.
    pub fn reevaluate_all(&mut self, buffer: BufferId) -> Result<Vec<CellId>> {
        let mut ran = Vec::new();
        for kernel_id in self.kernels_on(buffer) {
            ran.extend(self.session_mut(&kernel_id)?.reevaluate_all()?);
        }
        Ok(ran)
    }

    pub async fn interrupt(&mut self, buffer: BufferId, kernel: Option<&str>) -> Result<()> {
        let kernel_id = self.resolve_kernel(buffer, kernel)?;
        self.session_mut(&kernel_id)?.interrupt().await
    }

    pub async fn restart(
        &mut self,
        buffer: BufferId,
        kernel: Option<&str>,
        delete_outputs: bool,
    ) -> Result<()> {
        let kernel_id = self.resolve_kernel(buffer, kernel)?;
        self.session_mut(&kernel_id)?.restart(delete_outputs).await
    }

    /// Delete the cell under `position`. Returns false if there is none.
    pub fn delete_cell_at(&mut self, position: &Position) -> bool {
        match self.cell_at(position) {
            Some(found) => self
                .sessions
                .get_mut(&found.kernel_id)
                .map(|session| session.delete_cell(found.cell))
                .unwrap_or(false),
            None => false,
        }
    }

    // Polling

    fn polled_kernels(&self, buffer: Option<BufferId>) -> Vec<String> {
        match buffer {
            Some(buffer) => self.kernels_on(buffer),
            None => self.running_kernels(None),
        }
    }

    /// `tick` every kernel on `buffer` (or all kernels). Errors are logged
    /// per kernel so one failing session never starves the others.
    pub fn tick(&mut self, buffer: Option<BufferId>) -> Vec<(String, SessionEvent)> {
        let mut events = Vec::new();
        for kernel_id in self.polled_kernels(buffer) {
            let Some(session) = self.sessions.get_mut(&kernel_id) else {
                continue;
            };
            match session.tick() {
                Ok(session_events) => events.extend(
                    session_events
                        .into_iter()
                        .map(|event| (kernel_id.clone(), event)),
                ),
                Err(e) => log::warn!("[registry] tick of {} failed: {}", kernel_id, e),
            }
        }
        events
    }

    pub fn tick_input(&mut self, buffer: Option<BufferId>) -> Vec<(String, InputPrompt)> {
        let mut prompts = Vec::new();
        for kernel_id in self.polled_kernels(buffer) {
            let Some(session) = self.sessions.get_mut(&kernel_id) else {
                continue;
            };
            match session.tick_input() {
                Ok(Some(prompt)) => prompts.push((kernel_id, prompt)),
                Ok(None) => {}
                Err(e) => log::warn!("[registry] tick_input of {} failed: {}", kernel_id, e),
            }
        }
        prompts
    }

    pub fn send_stdin(&mut self, kernel_id: &str, text: &str) -> Result<()> {
        self.session_mut(kernel_id)?.send_stdin(text)
    }

    /// True if no kernel on `buffer` has an unanswered request.
    pub fn is_idle(&self, buffer: BufferId) -> bool {
        self.kernels_on(buffer).iter().all(|kernel_id| {
            self.sessions
                .get(kernel_id)
                .map_or(true, |session| session.pending_count() == 0)
        })
    }

    // Queries

    /// Every cell on `buffer` across all attached kernels, by live `begin`.
    pub fn sorted_cells(&self, buffer: BufferId) -> Vec<CellRef> {
        let mut cells: Vec<CellRef> = Vec::new();
        for kernel_id in self.kernels_on(buffer) {
            let Some(session) = self.sessions.get(&kernel_id) else {
                continue;
            };
            for id in session.sorted_cell_ids(Some(buffer)) {
                if let Some(cell) = session.cell(id) {
                    let (begin, end) = cell.span();
                    cells.push(CellRef {
                        kernel_id: kernel_id.clone(),
                        cell: id,
                        begin,
                        end,
                    });
                }
            }
        }
        cells.sort_by(|a, b| (a.begin, a.end).cmp(&(b.begin, b.end)));
        cells
    }

    pub fn cell_at(&self, position: &Position) -> Option<CellRef> {
        self.sorted_cells(position.buffer_id)
            .into_iter()
            .find(|found| position.point().is_within(found.begin, found.end))
    }

    /// Start of the cell `count` cells away from `point`, wrapping around the
    /// buffer. Negative counts move backwards. `None` if the buffer has no
    /// cells.
    ///
    /// A point inside a cell, or in the gap after it, counts as being on that
    /// cell. Before the first cell, moving forward lands on the first cell;
    /// past the last one, moving back lands on the last.
    pub fn next_cell(&self, buffer: BufferId, point: Point, count: isize) -> Option<Point> {
        let cells = self.sorted_cells(buffer);
        let first = cells.first()?;
        let last = cells.last()?;
        let len = cells.len() as isize;

        let mut count = count;
        let start = if point < first.begin {
            if count > 0 {
                count -= 1;
            }
            0
        } else if last.end < point {
            if count < 0 {
                count += 1;
            }
            len - 1
        } else {
            cells
                .iter()
                .rposition(|cell| cell.begin <= point)
                .unwrap_or(0) as isize
        };
        let target = (start + count).rem_euclid(len) as usize;
        cells.get(target).map(|cell| cell.begin)
    }

    pub fn prev_cell(&self, buffer: BufferId, point: Point, count: isize) -> Option<Point> {
        self.next_cell(buffer, point, -count)
    }

    /// Start of the `n`th cell on `buffer`, counting from 1 and wrapping.
    pub fn goto_cell(&self, buffer: BufferId, n: isize) -> Option<Point> {
        let cells = self.sorted_cells(buffer);
        if cells.is_empty() {
            return None;
        }
        let index = (n - 1).rem_euclid(cells.len() as isize) as usize;
        cells.get(index).map(|cell| cell.begin)
    }

    pub fn output(&self, kernel_id: &str, cell: CellId) -> Option<&CellOutput> {
        self.sessions.get(kernel_id)?.output(cell)
    }

    // Persistence

    /// Snapshot `kernel`'s cells on `buffer`.
    pub fn save(&self, buffer: BufferId, kernel: Option<&str>) -> Result<SessionData> {
        let kernel_id = self.resolve_kernel(buffer, kernel)?;
        Ok(persist::save(self.session(&kernel_id)?, buffer))
    }

    /// Start the saved kernel on `buffer` and restore its cells and outputs.
    ///
    /// The buffer must not have a kernel yet. If restoring fails the new
    /// kernel is torn down again.
    pub async fn load(
        &mut self,
        buffer: &BufferHandle,
        server_url: &str,
        data: &SessionData,
        shared: bool,
    ) -> Result<String> {
        if self.is_attached(buffer.id()) {
            return Err(KernelError::InvalidSessionData(format!(
                "buffer {} already has a kernel; loading starts one",
                buffer.id()
            )));
        }
        let kernel_id = self
            .initialize_buffer(buffer, server_url, &data.kernel, shared)
            .await?;
        let restored = {
            let session = self.session_mut(&kernel_id)?;
            persist::load(session, buffer, data)
        };
        match restored {
            Ok(cells) => {
                log::info!(
                    "[registry] Restored {} cells of {} on buffer {}",
                    cells.len(),
                    kernel_id,
                    buffer.id()
                );
                Ok(kernel_id)
            }
            Err(e) => {
                if let Err(deinit_err) = self.deinit_kernels(vec![kernel_id]).await {
                    log::warn!("[registry] Cleanup after failed load: {}", deinit_err);
                }
                Err(e)
            }
        }
    }
}
