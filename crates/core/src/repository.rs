//! Storage collaborator.
//!
//! The core never persists anything itself. A session reads its snapshot through
//! [`FactRepository`] (or is handed one directly) and writes back exactly once, through
//! [`FactRepository::commit`], with the complete new state of the encounter.

use crate::error::StorageError;
use crate::fact::{Encounter, ProgramEnrollment};
use crate::submission::SubmissionSummary;
use formentry_types::{FactId, PersonId};

/// Everything one submission changes, committed as a unit.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EncounterChanges {
    pub encounter: Encounter,
    /// Every enrollment of the subject after the submission, changed or not.
    pub enrollments: Vec<ProgramEnrollment>,
    pub summary: SubmissionSummary,
}

pub trait FactRepository {
    /// The stored encounter with `id`, voided facts included.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails; a missing encounter is `Ok(None)`.
    fn encounter(&self, id: FactId) -> Result<Option<Encounter>, StorageError>;

    /// Program enrollments of `person`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    fn enrollments(&self, person: PersonId) -> Result<Vec<ProgramEnrollment>, StorageError>;

    /// Stores `changes` atomically: either all of it becomes visible or none of it does.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if nothing could be stored.
    fn commit(&mut self, changes: &EncounterChanges) -> Result<(), StorageError>;
}
