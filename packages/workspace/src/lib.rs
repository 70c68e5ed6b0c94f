pub mod backend;
pub mod host;
pub mod server;
pub mod watcher;

pub use backend::{BackendError, BackendResult, LocalBackend};
pub use host::{HostError, HostResult, SessionHost};
pub use server::{router, serve, ServerError, ServerResult};
pub use watcher::{DataDirWatcher, WatcherError, WatcherResult};
