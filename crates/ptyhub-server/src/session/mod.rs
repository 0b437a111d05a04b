//! Session management: PTY lifecycle, workspaces, output buffering.

pub mod manager;
pub mod output_buffer;
pub mod pty;
pub mod sanitize;
#[allow(clippy::module_inception)]
pub mod session;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{ManagerConfig, SessionManager};
pub use output_buffer::OutputBuffer;
pub use pty::{NativePtySpawner, PtyHandle, PtyProcess, PtySpawner, SpawnRequest};
pub use session::{Session, SessionParams};
pub use workspace::Workspace;
