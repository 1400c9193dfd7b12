//! Remote operations built on an authenticated session.

pub mod shell;
pub mod sync;

pub use shell::{CommandOutput, RemoteShell, ShellService};
pub use sync::{DirEntry, EntryKind, RemoteFiles, SyncHandle, SyncService};
