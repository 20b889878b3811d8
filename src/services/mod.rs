//! External collaborators the stages depend on.
//!
//! Each collaborator is a trait so stages can be driven by fakes in tests;
//! the shipped implementations are enough to run the pipeline end to end.

pub mod classify;
pub mod extract;
pub mod notify;
pub mod portal;
pub mod storage;

pub use classify::{Classification, ClassifyError, Classifier, DocumentCategory, MimeClassifier};
pub use extract::{ExtractError, ExtractorConfig, FieldExtractor, Fields, HttpFieldExtractor};
pub use notify::{Notifier, QueueNotifier};
pub use portal::{FetchOutcome, FetchedOs, InboxPortal, OsMetadata, Portal, PortalError};
pub use storage::{LocalObjectStore, ObjectStore, StorageError};
