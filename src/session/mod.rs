// Session state: persisted records, lifecycle/commit state machines and
// the change-notification bus.

pub mod events;
pub mod service;
pub mod store;
pub mod types;

pub use events::{EventBus, StatusEvent};
pub use service::{
    CommitJobData, Committer, GitCloner, GitCommitter, SessionError, SessionService,
    WorkspaceCloner, COMMIT_JOB_KIND,
};
pub use store::{StateStore, StoreError};
pub use types::{CommitStatus, Session, SessionStatus, Workspace};
