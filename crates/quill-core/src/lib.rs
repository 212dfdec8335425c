//! Quill Core - editor session coordination
//!
//! Keeps one document buffer consistent while three asynchronous actors
//! touch it:
//! - Debounced autosave with bounded retry and backoff
//! - AI text transformations applied only to the revision they were asked on
//! - File uploads validated up front and inserted on completion
//!
//! # Example
//!
//! ```rust,ignore
//! use quill_core::prelude::*;
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), SessionError> {
//! let session = SessionController::open("doc-1", SessionConfig::new(), collaborators).await?;
//!
//! session.edit("Hello, world")?;
//! let request = session.dispatch_assist(AssistIntent::improve("Hello, world"))?;
//!
//! let status = session.settled().await;
//! println!("saved revision {}", status.last_saved_revision);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod assist;
pub mod autosave;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod journal;
pub mod session;
pub mod store;
pub mod types;
pub mod upload;

// Re-exports for convenience
pub use assist::{build_prompt, AssistCoordinator, AssistDispatch, AssistResolution};
pub use autosave::{AutosavePlanner, Backoff, DebounceAction, SaveFollowUp, SaveTicket, SaveTrigger};
pub use collaborators::{
    AssistClient, Collaborators, PersistenceClient, SaveReceipt, SaveRequest, UploadClient,
};
pub use config::{AssistPolicy, SessionConfig};
pub use error::{
    AssistError, ConfigError, ErrorKind, FaultOrigin, PersistError, SessionError, SessionFault,
    UploadError, ValidationError,
};
pub use journal::{EventKind, Journal, SessionEvent};
pub use session::{SessionController, SessionStatus};
pub use store::{ContentStore, InsertPosition, InsertionRejected};
pub use types::{
    AssetRef, AssistIntent, AssistKind, AssistRequest, AssistStatus, ContentSnapshot, Document,
    FileDescriptor, MergeStrategy, RequestId, Revision, SaveState, TaskId, UploadStatus,
    UploadTask,
};
pub use upload::{reference_marker, UploadCoordinator, UploadResolution};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding a session
    pub use crate::{
        AssistIntent, AssistKind, Collaborators, Document, FileDescriptor, MergeStrategy,
        SaveState, SaveTrigger, SessionConfig, SessionController, SessionError, SessionStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
