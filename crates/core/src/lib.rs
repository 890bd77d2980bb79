//! # Form Entry Core
//!
//! Core logic of the clinical form entry engine.
//!
//! This crate turns an XML form template into rendered HTML and a typed form schema, matches the
//! facts of a stored encounter back onto that schema, and turns a submitted form into the new
//! state of the encounter:
//! - Template preprocessing, macros, conditional blocks and repeats (`template`, `expression`)
//! - Tag compilation into widgets, schema fields and replayable elements (`compiler`)
//! - Reconciliation of stored facts with schema fields (`reconcile`)
//! - Validation and submission against a storage collaborator (`submission`, `repository`)
//!
//! **No I/O**: metadata lookup and persistence are collaborator traits ([`MetadataResolver`],
//! [`FactRepository`]). The in-memory implementations in [`memory`] back the CLI and tests.

pub mod compiler;
pub mod config;
pub mod constants;
pub mod context;
pub mod default_value;
pub mod element;
pub mod error;
pub mod expression;
pub mod fact;
pub mod memory;
pub mod metadata;
pub mod reconcile;
pub mod repository;
pub mod schema;
pub mod session;
pub mod subject;
pub mod submission;
pub mod template;
pub mod widget;

pub use config::CoreConfig;
pub use context::{FormContext, Mode};
pub use error::{FieldError, FormError, FormResult, StorageError};
pub use fact::{Encounter, FactValue, Obs, Order, ProgramEnrollment, VoidInfo};
pub use memory::{InMemoryFactRepository, InMemoryMetadata};
pub use metadata::MetadataResolver;
pub use repository::{EncounterChanges, FactRepository};
pub use schema::FormSchema;
pub use session::{FormEntrySession, SessionRequest, SubmissionOutcome};
pub use subject::Subject;
pub use submission::{Submission, SubmissionSummary};
