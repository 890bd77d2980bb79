//! Stored clinical facts: observations, orders, program enrollments and the encounter that
//! owns them.
//!
//! Facts are never edited in place. A changed value voids the old fact and creates a new one
//! whose `previous_version` points back at it, so every fact heads a backward revision chain.

use chrono::{NaiveDate, NaiveDateTime};
use formentry_types::{ConceptId, FactId, LocationId, PersonId, ProgramId, WorkflowId, WorkflowStateId};

/// The value carried by an observation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FactValue {
    Coded(ConceptId),
    Numeric(f64),
    Text(String),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
    Boolean(bool),
}

impl FactValue {
    pub fn as_coded(&self) -> Option<ConceptId> {
        match self {
            Self::Coded(id) => Some(*id),
            _ => None,
        }
    }
}

/// Soft-delete marker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VoidInfo {
    pub reason: String,
    #[serde(default)]
    pub voided_by: Option<PersonId>,
    pub voided_at: NaiveDateTime,
}

/// Namespaced path linking a fact back to the template control that produced it.
///
/// The path has the shape `<form name>.<form version>/<control id>-<counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FormPath {
    pub namespace: String,
    pub path: String,
}

impl FormPath {
    pub fn for_control(namespace: &str, form_name: &str, form_version: &str, control_id: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            path: format!("{form_name}.{form_version}/{control_id}-0"),
        }
    }

    /// The control id part of the path, without the trailing counter.
    ///
    /// `Vitals.1.0/weight-2-0` yields `weight-2`.
    pub fn control_id(&self) -> Option<&str> {
        let (_, control) = self.path.split_once('/')?;
        match control.rsplit_once('-') {
            Some((head, counter)) if !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()) => {
                Some(head)
            }
            _ => Some(control),
        }
    }
}

impl std::fmt::Display for FormPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}^{}", self.namespace, self.path)
    }
}

/// An observation, optionally grouping member observations.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Obs {
    pub id: FactId,
    pub concept: ConceptId,
    #[serde(default)]
    pub value: Option<FactValue>,
    pub obs_datetime: NaiveDateTime,
    #[serde(default)]
    pub members: Vec<Obs>,
    #[serde(default)]
    pub voided: Option<VoidInfo>,
    #[serde(default)]
    pub previous_version: Option<FactId>,
    #[serde(default)]
    pub form_path: Option<FormPath>,
}

impl Obs {
    pub fn new(concept: ConceptId, value: Option<FactValue>, obs_datetime: NaiveDateTime) -> Self {
        Self {
            id: FactId::new(),
            concept,
            value,
            obs_datetime,
            members: Vec::new(),
            voided: None,
            previous_version: None,
            form_path: None,
        }
    }

    /// A new group marker with no members yet.
    pub fn group(concept: ConceptId, obs_datetime: NaiveDateTime) -> Self {
        Self::new(concept, None, obs_datetime)
    }

    pub fn with_member(mut self, member: Obs) -> Self {
        self.members.push(member);
        self
    }

    pub fn is_voided(&self) -> bool {
        self.voided.is_some()
    }

    pub fn is_group(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn value_coded(&self) -> Option<ConceptId> {
        self.value.as_ref().and_then(FactValue::as_coded)
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Obs> {
        self.members.iter().filter(|m| !m.is_voided())
    }

    /// Marks this observation and all of its members voided.
    pub fn void(&mut self, info: &VoidInfo) {
        if self.voided.is_none() {
            self.voided = Some(info.clone());
        }
        for member in &mut self.members {
            member.void(info);
        }
    }

    fn find(&self, id: FactId) -> Option<&Obs> {
        if self.id == id {
            return Some(self);
        }
        self.members.iter().find_map(|m| m.find(id))
    }

    fn find_mut(&mut self, id: FactId) -> Option<&mut Obs> {
        if self.id == id {
            return Some(self);
        }
        self.members.iter_mut().find_map(|m| m.find_mut(id))
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Obs>) {
        out.push(self);
        for member in &self.members {
            member.collect(out);
        }
    }
}

/// A clinical order placed from a form.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Order {
    pub id: FactId,
    pub concept: ConceptId,
    pub start_date: NaiveDateTime,
    #[serde(default)]
    pub voided: Option<VoidInfo>,
    #[serde(default)]
    pub form_path: Option<FormPath>,
}

impl Order {
    pub fn is_voided(&self) -> bool {
        self.voided.is_some()
    }
}

/// A time-bounded state of a program workflow.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PatientState {
    pub workflow: WorkflowId,
    pub state: WorkflowStateId,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl PatientState {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| date < end)
    }
}

/// Enrollment of a person in a care program. Enrollments belong to the person rather than to
/// an encounter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProgramEnrollment {
    pub id: FactId,
    pub person: PersonId,
    pub program: ProgramId,
    pub date_enrolled: NaiveDate,
    #[serde(default)]
    pub date_completed: Option<NaiveDate>,
    #[serde(default)]
    pub states: Vec<PatientState>,
    #[serde(default)]
    pub voided: bool,
}

impl ProgramEnrollment {
    pub fn new(person: PersonId, program: ProgramId, date_enrolled: NaiveDate) -> Self {
        Self {
            id: FactId::new(),
            person,
            program,
            date_enrolled,
            date_completed: None,
            states: Vec::new(),
            voided: false,
        }
    }

    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        !self.voided
            && self.date_enrolled <= date
            && self.date_completed.map_or(true, |done| date < done)
    }

    pub fn state_on(&self, workflow: WorkflowId, date: NaiveDate) -> Option<&PatientState> {
        self.states
            .iter()
            .find(|s| s.workflow == workflow && s.is_active_on(date))
    }

    /// Ends the current state of `workflow` and starts `state` on `date`.
    pub fn transition(&mut self, workflow: WorkflowId, state: WorkflowStateId, date: NaiveDate) {
        for current in self
            .states
            .iter_mut()
            .filter(|s| s.workflow == workflow && s.end_date.is_none())
        {
            current.end_date = Some(date);
        }
        self.states.push(PatientState {
            workflow,
            state,
            start_date: date,
            end_date: None,
        });
    }
}

/// A clinical encounter and the facts recorded during it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Encounter {
    pub id: FactId,
    pub patient: PersonId,
    pub encounter_datetime: NaiveDateTime,
    #[serde(default)]
    pub location: Option<LocationId>,
    #[serde(default)]
    pub provider: Option<PersonId>,
    #[serde(default)]
    pub obs: Vec<Obs>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub voided: Option<VoidInfo>,
}

impl Encounter {
    pub fn new(patient: PersonId, encounter_datetime: NaiveDateTime) -> Self {
        Self {
            id: FactId::new(),
            patient,
            encounter_datetime,
            location: None,
            provider: None,
            obs: Vec::new(),
            orders: Vec::new(),
            voided: None,
        }
    }

    pub fn active_obs(&self) -> impl Iterator<Item = &Obs> {
        self.obs.iter().filter(|o| !o.is_voided())
    }

    pub fn active_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(|o| !o.is_voided())
    }

    pub fn has_active_data(&self) -> bool {
        self.active_obs().next().is_some() || self.active_orders().next().is_some()
    }

    /// Every observation at any depth, voided ones included, in stored order.
    pub fn all_obs(&self) -> Vec<&Obs> {
        let mut out = Vec::new();
        for obs in &self.obs {
            obs.collect(&mut out);
        }
        out
    }

    pub fn find_obs(&self, id: FactId) -> Option<&Obs> {
        self.obs.iter().find_map(|o| o.find(id))
    }

    pub fn find_obs_mut(&mut self, id: FactId) -> Option<&mut Obs> {
        self.obs.iter_mut().find_map(|o| o.find_mut(id))
    }

    /// Active observations at any depth whose control path names `control_id`.
    pub fn active_obs_by_control_id(&self, control_id: &str) -> Vec<&Obs> {
        self.all_obs()
            .into_iter()
            .filter(|o| !o.is_voided())
            .filter(|o| {
                o.form_path
                    .as_ref()
                    .and_then(FormPath::control_id)
                    .is_some_and(|c| c == control_id)
            })
            .collect()
    }

    /// Moves the encounter to `when`. Active observations timestamped at the old encounter time
    /// move with it.
    pub fn move_to(&mut self, when: NaiveDateTime) {
        fn follow(obs: &mut Obs, from: NaiveDateTime, to: NaiveDateTime) {
            if obs.is_voided() {
                return;
            }
            if obs.obs_datetime == from {
                obs.obs_datetime = to;
            }
            for member in &mut obs.members {
                follow(member, from, to);
            }
        }

        let from = self.encounter_datetime;
        for obs in &mut self.obs {
            follow(obs, from, when);
        }
        self.encounter_datetime = when;
    }

    /// The observation `id` followed by every version it superseded, newest first.
    ///
    /// Voided predecessors are included; the chain stops at the first missing link.
    pub fn revision_chain(&self, id: FactId) -> Vec<&Obs> {
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(current) = next {
            let Some(obs) = self.find_obs(current) else {
                break;
            };
            if chain.iter().any(|seen: &&Obs| seen.id == obs.id) {
                break;
            }
            chain.push(obs);
            next = obs.previous_version;
        }
        chain
    }
}
