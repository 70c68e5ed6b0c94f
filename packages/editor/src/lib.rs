//! # Vows Editor
//!
//! Document synchronization engine for the wedding site editor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ widgets: field edits, add/remove, save      │
//! └─────────────────────────────────────────────┘
//!          ↓ set_pending            ↓ commit
//! ┌──────────────────────┐ ┌────────────────────┐
//! │ PendingTracker       │ │ DocumentStore      │ ◀── RealtimeReconciler
//! │  unsaved overlay     │ │  optimistic commit │     (remote pushes)
//! └──────────────────────┘ └────────────────────┘
//!                     ↓ merge
//! ┌─────────────────────────────────────────────┐
//! │ PreviewChannel: DATA_UPDATE/SURFACE_CHANGED │ ◀── TemplatePreview
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Committed is what the server has**: the store only diverges from it
//!    while a commit is in flight, and rolls back if the write fails
//! 2. **Pending is never lost**: unsaved edits survive failed saves and
//!    remote pushes; they are only dropped once committed or cleared
//! 3. **Snapshots are whole**: the surface always receives a fully merged
//!    document
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vows_editor::{EditorSession, EngineConfig, Services};
//!
//! let session = EditorSession::start(identity, services, surface, EngineConfig::default()).await?;
//!
//! session.set_pending("couple", "partnerOne", json!("Alex"))?;
//! session.set_pending_item("schedule", 1, "time", json!("5:00 PM"))?;
//! session.save_all().await?;
//!
//! session.end();
//! ```

mod config;
mod errors;
mod pending;
mod preview;
mod realtime;
mod services;
mod session;
mod store;
mod template;
mod validator;

#[cfg(test)]
mod test_support;

pub use config::{EngineConfig, DEFAULT_REALTIME_RETRY, DEFAULT_SLUG_DEBOUNCE, MAX_REALTIME_RETRY};
pub use errors::{
    LookupError, PersistenceError, RealtimeError, SurfaceError, SyncError, SyncResult,
};
pub use pending::{PendingChanges, PendingItem, PendingSection, PendingTracker};
pub use preview::{PreviewChannel, SnapshotSource, SurfaceEndpoint, SurfaceMessage};
pub use realtime::RealtimeReconciler;
pub use services::{
    PersistenceService, RealtimeService, RemoteChange, Services, Subscription,
    SubscriptionHandle, UniquenessCheck,
};
pub use session::EditorSession;
pub use store::DocumentStore;
pub use template::TemplatePreview;
pub use validator::{
    validate_format, FormatError, SlugValidator, ValidationState, MAX_SLUG_LEN, MIN_SLUG_LEN,
    RESERVED_SLUGS,
};

// Re-export common types for convenience
pub use vows_common::{Document, DocumentPatch, OwnerIdentity};
