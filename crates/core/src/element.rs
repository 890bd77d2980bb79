//! Compiled form elements.
//!
//! The compiler records one [`FormElement`] per clinical tag, in document order, with whatever
//! it matched in the stored record. Submission replays the list against the request.

use crate::fact::{Obs, Order};
use formentry_types::{ConceptId, ProgramId, WorkflowId, WorkflowStateId};

#[derive(Debug, Clone, PartialEq)]
pub struct ObsElement {
    pub field_name: String,
    pub concept: ConceptId,
    pub required: bool,
    pub control_id: Option<String>,
    /// The stored observation this field was reconciled with.
    pub existing: Option<Obs>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupElement {
    pub concept: ConceptId,
    pub existing: Option<Obs>,
}

/// A location or provider picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceElement {
    pub field_name: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentElement {
    pub field_name: String,
    pub date_field: Option<String>,
    pub program: ProgramId,
    /// Whether the subject was already enrolled on the encounter date.
    pub enrolled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStateElement {
    pub field_name: String,
    pub program: ProgramId,
    pub workflow: WorkflowId,
    pub current: Option<WorkflowStateId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderElement {
    pub field_name: String,
    pub concept: ConceptId,
    pub existing: Option<Order>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormElement {
    Obs(ObsElement),
    GroupStart(GroupElement),
    GroupEnd,
    EncounterDate { field_name: String },
    EncounterLocation(ReferenceElement),
    EncounterProvider(ReferenceElement),
    EnrollInProgram(EnrollmentElement),
    WorkflowState(WorkflowStateElement),
    Order(OrderElement),
}

impl FormElement {
    /// Field names whose submitted values this element reads.
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Self::Obs(e) => vec![&e.field_name],
            Self::GroupStart(_) | Self::GroupEnd => Vec::new(),
            Self::EncounterDate { field_name } => vec![field_name],
            Self::EncounterLocation(e) | Self::EncounterProvider(e) => vec![&e.field_name],
            Self::EnrollInProgram(e) => std::iter::once(e.field_name.as_str())
                .chain(e.date_field.as_deref())
                .collect(),
            Self::WorkflowState(e) => vec![&e.field_name],
            Self::Order(e) => vec![&e.field_name],
        }
    }
}
