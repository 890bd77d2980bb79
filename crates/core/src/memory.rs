//! In-memory collaborators.
//!
//! [`InMemoryMetadata`] and [`InMemoryFactRepository`] back the CLI and the integration tests.
//! Both load from YAML so fixtures can be kept next to the templates that use them.

use crate::error::StorageError;
use crate::fact::{Encounter, ProgramEnrollment};
use crate::metadata::{Concept, Location, MetadataRef, MetadataResolver, Person, Program, ProgramWorkflow};
use crate::repository::{EncounterChanges, FactRepository};
use crate::{FormError, FormResult};
use formentry_types::{FactId, PersonId};
use std::collections::BTreeMap;

/// A metadata dictionary held in memory.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InMemoryMetadata {
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub providers: Vec<Person>,
    #[serde(default)]
    pub programs: Vec<Program>,
}

impl InMemoryMetadata {
    /// Load a dictionary from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` if the YAML does not describe a dictionary.
    pub fn from_yaml_str(yaml: &str) -> FormResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FormError::InvalidInput(format!("invalid metadata: {e}")))
    }

    pub fn with_concept(mut self, concept: Concept) -> Self {
        self.concepts.push(concept);
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    pub fn with_provider(mut self, provider: Person) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_program(mut self, program: Program) -> Self {
        self.programs.push(program);
        self
    }
}

impl MetadataResolver for InMemoryMetadata {
    fn concept(&self, reference: &str) -> Option<Concept> {
        let reference = MetadataRef::parse(reference);
        self.concepts
            .iter()
            .find(|c| match reference {
                MetadataRef::Mapping { source, code } => c
                    .mappings
                    .iter()
                    .any(|m| m.source.eq_ignore_ascii_case(source) && m.code.eq_ignore_ascii_case(code)),
                _ => reference.matches(c.id.get(), c.uuid.as_deref(), &c.name),
            })
            .cloned()
    }

    fn location(&self, reference: &str) -> Option<Location> {
        let reference = MetadataRef::parse(reference);
        self.locations
            .iter()
            .find(|l| reference.matches(l.id.get(), l.uuid.as_deref(), &l.name))
            .cloned()
    }

    fn person(&self, reference: &str) -> Option<Person> {
        let reference = MetadataRef::parse(reference);
        self.providers
            .iter()
            .find(|p| reference.matches(p.id.get(), p.uuid.as_deref(), &p.name))
            .cloned()
    }

    fn program(&self, reference: &str) -> Option<Program> {
        let reference = MetadataRef::parse(reference);
        self.programs
            .iter()
            .find(|p| reference.matches(p.id.get(), p.uuid.as_deref(), &p.name))
            .cloned()
    }

    fn workflow(&self, reference: &str) -> Option<(Program, ProgramWorkflow)> {
        let reference = MetadataRef::parse(reference);
        self.programs.iter().find_map(|program| {
            program
                .workflows
                .iter()
                .find(|w| reference.matches(w.id.get(), None, &w.name))
                .map(|w| (program.clone(), w.clone()))
        })
    }

    fn all_locations(&self) -> Vec<Location> {
        self.locations.clone()
    }

    fn all_providers(&self) -> Vec<Person> {
        self.providers.clone()
    }
}

/// Encounters and enrollments held in memory.
///
/// A commit replaces the stored encounter and the subject's enrollments in one step. Setting
/// [`fail_commits`](Self::fail_commits) makes every commit fail without storing anything.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFactRepository {
    encounters: BTreeMap<FactId, Encounter>,
    enrollments: Vec<ProgramEnrollment>,
    commits: usize,
    pub fail_commits: bool,
}

impl InMemoryFactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encounter(mut self, encounter: Encounter) -> Self {
        self.encounters.insert(encounter.id, encounter);
        self
    }

    pub fn with_enrollment(mut self, enrollment: ProgramEnrollment) -> Self {
        self.enrollments.push(enrollment);
        self
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn encounters(&self) -> impl Iterator<Item = &Encounter> {
        self.encounters.values()
    }
}

impl FactRepository for InMemoryFactRepository {
    fn encounter(&self, id: FactId) -> Result<Option<Encounter>, StorageError> {
        Ok(self.encounters.get(&id).cloned())
    }

    fn enrollments(&self, person: PersonId) -> Result<Vec<ProgramEnrollment>, StorageError> {
        Ok(self
            .enrollments
            .iter()
            .filter(|e| e.person == person)
            .cloned()
            .collect())
    }

    fn commit(&mut self, changes: &EncounterChanges) -> Result<(), StorageError> {
        if self.fail_commits {
            return Err(StorageError::Backend("commits are disabled".into()));
        }

        let person = changes.encounter.patient;
        self.enrollments.retain(|e| e.person != person);
        self.enrollments.extend(changes.enrollments.iter().cloned());
        self.encounters.insert(changes.encounter.id, changes.encounter.clone());
        self.commits += 1;
        tracing::debug!("committed encounter {}", changes.encounter.id);
        Ok(())
    }
}
