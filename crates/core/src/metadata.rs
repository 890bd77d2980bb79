//! Metadata dictionary types and the resolver collaborator.
//!
//! Templates refer to concepts, locations, people and programs by reference strings. A reference
//! is a numeric id, a UUID, a `SOURCE:CODE` mapping, or a name; [`MetadataRef::parse`] decides
//! which, and a [`MetadataResolver`] looks it up.

use formentry_types::{ConceptId, LocationId, PersonId, ProgramId, WorkflowId, WorkflowStateId};

/// Value type of a concept, which decides the widget used to capture it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConceptDatatype {
    Numeric {
        #[serde(default)]
        low: Option<f64>,
        #[serde(default)]
        high: Option<f64>,
        /// Whether decimal values are allowed.
        #[serde(default)]
        precise: bool,
    },
    Coded,
    Text,
    Date,
    Datetime,
    Boolean,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConceptMapping {
    pub source: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
    pub datatype: ConceptDatatype,
    /// Allowed answers of a coded concept, in display order.
    #[serde(default)]
    pub answers: Vec<ConceptId>,
    /// Members of a concept set.
    #[serde(default)]
    pub set_members: Vec<ConceptId>,
    #[serde(default)]
    pub mappings: Vec<ConceptMapping>,
}

impl Concept {
    pub fn is_set(&self) -> bool {
        !self.set_members.is_empty()
    }

    pub fn is_coded(&self) -> bool {
        matches!(self.datatype, ConceptDatatype::Coded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub id: LocationId,
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Person {
    pub id: PersonId,
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowStateId,
    pub name: String,
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProgramWorkflow {
    pub id: WorkflowId,
    pub name: String,
    pub states: Vec<WorkflowState>,
}

impl ProgramWorkflow {
    pub fn state(&self, id: WorkflowStateId) -> Option<&WorkflowState> {
        self.states.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub id: ProgramId,
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default)]
    pub workflows: Vec<ProgramWorkflow>,
}

impl Program {
    pub fn workflow(&self, id: WorkflowId) -> Option<&ProgramWorkflow> {
        self.workflows.iter().find(|w| w.id == id)
    }
}

/// A parsed metadata reference from a template attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRef<'a> {
    Id(u32),
    Mapping { source: &'a str, code: &'a str },
    /// A UUID or a display name; resolvers try both.
    Name(&'a str),
}

impl<'a> MetadataRef<'a> {
    pub fn parse(reference: &'a str) -> Self {
        let reference = reference.trim();
        if let Ok(id) = reference.parse::<u32>() {
            return Self::Id(id);
        }
        if let Some((source, code)) = reference.split_once(':') {
            if !source.is_empty() && !code.is_empty() {
                return Self::Mapping {
                    source: source.trim(),
                    code: code.trim(),
                };
            }
        }
        Self::Name(reference)
    }

    /// Whether this reference points at an item with the given identity.
    pub fn matches(&self, id: u32, uuid: Option<&str>, name: &str) -> bool {
        match self {
            Self::Id(wanted) => *wanted == id,
            Self::Mapping { .. } => false,
            Self::Name(text) => {
                uuid.is_some_and(|u| u.eq_ignore_ascii_case(text)) || name.eq_ignore_ascii_case(text)
            }
        }
    }
}

/// Lookup of metadata referenced by templates.
///
/// Implemented by the hosting application; the core only consumes it. Every method returns an
/// owned value so implementations are free to build results on demand.
pub trait MetadataResolver {
    fn concept(&self, reference: &str) -> Option<Concept>;

    fn location(&self, reference: &str) -> Option<Location>;

    fn person(&self, reference: &str) -> Option<Person>;

    fn program(&self, reference: &str) -> Option<Program>;

    /// Find a workflow by reference together with the program that owns it.
    fn workflow(&self, reference: &str) -> Option<(Program, ProgramWorkflow)>;

    /// Every location, used when a location picker does not restrict its options.
    fn all_locations(&self) -> Vec<Location>;

    /// Every person that may act as an encounter provider.
    fn all_providers(&self) -> Vec<Person>;

    fn concept_by_id(&self, id: ConceptId) -> Option<Concept> {
        self.concept(&id.to_string())
    }
}
