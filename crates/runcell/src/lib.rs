//! Kernel sessions and position-tracked code cells for Jupyter servers.
//!
//! `runcell` keeps live connections to kernels behind a Jupyter Server (REST
//! for lifecycle, one WebSocket per kernel for messages), tracks code cells
//! as edit-following regions of host-owned text buffers, and routes kernel
//! output back to the cell that produced it.
//!
//! The host owns a [`SessionRegistry`] and calls [`SessionRegistry::tick`]
//! from its own loop; nothing in this crate touches session state from a
//! background task.
//!
//! ```no_run
//! use runcell::{BufferHandle, BufferId, Point, SessionRegistry, Settings};
//!
//! # async fn run() -> runcell::Result<()> {
//! let buffer = BufferHandle::from_text(BufferId(1), "x = 40 + 2\nprint(x)");
//! let mut registry = SessionRegistry::new(Settings::default());
//! let kernel = registry
//!     .initialize_buffer(&buffer, "http://localhost:8888/?token=abc", "python3", false)
//!     .await?;
//! let cell = registry
//!     .evaluate(&buffer, Some(&kernel), Point::new(0, 0), Point::new(1, usize::MAX))
//!     .await?;
//! while !registry.is_idle(buffer.id()) {
//!     for (kernel_id, event) in registry.tick(Some(buffer.id())) {
//!         println!("{kernel_id}: {event:?}");
//!     }
//!     tokio::time::sleep(registry.settings().tick_rate()).await;
//! }
//! println!("{}", registry.output(&kernel, cell).map(|o| o.text()).unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channels;
pub mod client;
pub mod code_cell;
pub mod error;
pub mod magic;
pub mod message;
pub mod output;
pub mod overlap;
pub mod persist;
pub mod position;
pub mod registry;
pub mod session;
pub mod settings;

pub use buffer::{Buffer, BufferHandle, BufferId};
pub use client::KernelClient;
pub use code_cell::{CellId, CodeCell};
pub use error::{KernelError, Result};
pub use output::{CellOutput, OutputChunk, OutputStatus};
pub use position::{Anchor, Point, Position};
pub use registry::{CellRef, SessionRegistry};
pub use session::{InputPrompt, KernelSession, KernelState, SessionEvent};
pub use settings::Settings;
