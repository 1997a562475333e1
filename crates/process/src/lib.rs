//! Supervision of one external engine process.
//!
//! This crate owns the OS side of running the image-generation engine: it
//! spawns the launch script through the platform shell, drains both output
//! pipes as raw chunks, and reports how the process ended. It knows nothing
//! about what the engine prints; interpretation happens in the application.
//!
//! # Example
//!
//! ```no_run
//! use easel_process::{ProcessEvent, ProcessSupervisor};
//! use std::path::Path;
//!
//! # async fn demo() -> Result<(), easel_process::ProcessError> {
//! let (supervisor, mut events) = ProcessSupervisor::new();
//! supervisor.start(Path::new("/opt/engine"), "./webui.sh", &["--api".to_string()])?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ProcessEvent::Output(chunk) => print!("{}", String::from_utf8_lossy(&chunk.bytes)),
//!         ProcessEvent::Exited(report) => {
//!             println!("engine exited: {}", report.describe());
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod kill;
mod output;
mod supervisor;

pub use kill::{kill_all_matching, KillOutput};
pub use output::{ExitReport, OutputChunk, ProcessEvent, RunId, StreamKind};
pub use supervisor::ProcessSupervisor;

use thiserror::Error;

/// Errors surfaced synchronously by the supervisor.
///
/// Crashes after a successful spawn are never returned from here; they arrive
/// as an [`ExitReport`] on the event channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// `start` was called while a previously started process is still alive.
    #[error("The engine process is already running")]
    AlreadyRunning,

    /// `terminate` was called with no live process.
    #[error("No engine process is running")]
    NotRunning,

    /// The OS refused to create the process.
    #[error("Failed to spawn engine process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The termination signal could not be delivered.
    #[error("Failed to signal engine process: {0}")]
    SignalFailed(#[source] std::io::Error),

    /// The system-wide kill command could not be run.
    #[error("Failed to run kill command: {0}")]
    KillFailed(#[source] std::io::Error),

    /// An empty process class would match every process on the system.
    #[error("Refusing to kill processes for an empty process class")]
    EmptyProcessClass,
}
