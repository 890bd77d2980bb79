//! Turning a submitted request back into fact changes.
//!
//! Validation reads every widget and collects every error before anything is decided. When the
//! request is valid, [`SubmissionActions`] replays the compiled elements in document order on a
//! working copy of the encounter and decides, field by field, whether to create, modify, void or
//! leave alone the fact the field was reconciled with. A changed value never overwrites: the old
//! fact is voided and its replacement points back at it.

use crate::config::CoreConfig;
use crate::constants::EMPTY_ENCOUNTER_VOID_REASON;
use crate::context::{FormContext, Mode};
use crate::element::{EnrollmentElement, FormElement, GroupElement, ObsElement, OrderElement, WorkflowStateElement};
use crate::error::FieldError;
use crate::fact::{Encounter, FactValue, FormPath, Obs, Order, ProgramEnrollment, VoidInfo};
use crate::repository::EncounterChanges;
use crate::schema::FormSchema;
use crate::widget::WidgetValue;
use crate::{FormError, FormResult};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use formentry_types::{ConceptId, FactId, LocationId, PersonId, WorkflowStateId};
use std::collections::BTreeMap;

/// Submitted request parameters, keyed by generated field name.
pub type Submission = BTreeMap<String, String>;

/// Counts of what a submission did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmissionSummary {
    pub created: usize,
    pub voided: usize,
    pub unchanged: usize,
    pub enrollments_changed: usize,
    pub encounter_voided: bool,
}

fn raw<'a>(submission: &'a Submission, field_name: &str) -> Option<&'a str> {
    submission.get(field_name).map(String::as_str)
}

fn parse_field(
    context: &FormContext,
    submission: &Submission,
    field_name: &str,
    now: NaiveDateTime,
) -> Result<Option<WidgetValue>, String> {
    match context.widget(field_name) {
        Some(widget) => widget.parse(raw(submission, field_name), now),
        None => Ok(None),
    }
}

/// Validates every field of the form.
///
/// # Arguments
///
/// * `context` - The compiled form's widget registry.
/// * `elements` - The compiled elements, in document order.
/// * `submission` - The submitted request.
/// * `fallback_encounter_date` - The encounter date to check against when the form does not
///   capture one.
/// * `now` - The current time.
///
/// # Returns
///
/// Every error found, keyed by field name; empty when the submission is valid.
pub fn validate(
    context: &FormContext,
    elements: &[FormElement],
    submission: &Submission,
    fallback_encounter_date: NaiveDate,
    now: NaiveDateTime,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let mut encounter_date = fallback_encounter_date;

    let check = |field_name: &str, required: bool, errors: &mut Vec<FieldError>| -> Option<WidgetValue> {
        match parse_field(context, submission, field_name, now) {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                if required {
                    errors.push(FieldError::new(field_name, "Required"));
                }
                None
            }
            Err(message) => {
                errors.push(FieldError::new(field_name, message));
                None
            }
        }
    };

    for element in elements {
        match element {
            FormElement::EncounterDate { field_name } => match check(field_name, true, &mut errors) {
                Some(WidgetValue::Date(date)) => encounter_date = date,
                Some(WidgetValue::Datetime(datetime)) => encounter_date = datetime.date(),
                _ => {}
            },
            FormElement::Obs(e) => {
                check(&e.field_name, e.required, &mut errors);
            }
            FormElement::EncounterLocation(e) | FormElement::EncounterProvider(e) => {
                check(&e.field_name, e.required, &mut errors);
            }
            FormElement::WorkflowState(e) => {
                check(&e.field_name, false, &mut errors);
            }
            FormElement::Order(e) => {
                check(&e.field_name, false, &mut errors);
            }
            FormElement::EnrollInProgram(_) | FormElement::GroupStart(_) | FormElement::GroupEnd => {}
        }
    }

    for element in elements {
        let FormElement::EnrollInProgram(e) = element else {
            continue;
        };
        let checked = check(&e.field_name, false, &mut errors).is_some();
        let Some(date_field) = &e.date_field else {
            continue;
        };
        match check(date_field, false, &mut errors) {
            Some(WidgetValue::Date(date)) if checked && date > encounter_date => {
                errors.push(FieldError::new(
                    date_field.as_str(),
                    "Enrollment date cannot be after the encounter date",
                ));
            }
            _ => {}
        }
    }

    if !errors.is_empty() {
        tracing::debug!("submission rejected with {} field errors", errors.len());
    }
    errors
}

/// A group opened while replaying elements.
struct GroupFrame {
    concept: ConceptId,
    existing: Option<FactId>,
    active_before: usize,
    voided: usize,
    added: Vec<Obs>,
}

/// Replays compiled elements against a submission.
pub struct SubmissionActions<'a> {
    config: &'a CoreConfig,
    context: &'a FormContext,
    submission: &'a Submission,
    now: NaiveDateTime,
    void_info: VoidInfo,
    encounter: Encounter,
    enrollments: Vec<ProgramEnrollment>,
    frames: Vec<GroupFrame>,
    summary: SubmissionSummary,
}

impl<'a> SubmissionActions<'a> {
    /// Starts from the stored encounter, or a fresh one for `patient` when there is none.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a CoreConfig,
        context: &'a FormContext,
        submission: &'a Submission,
        patient: PersonId,
        encounter: Option<&Encounter>,
        enrollments: &[ProgramEnrollment],
        user: Option<PersonId>,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            config,
            context,
            submission,
            now,
            void_info: VoidInfo {
                reason: config.void_reason().to_owned(),
                voided_by: user,
                voided_at: now,
            },
            encounter: encounter.cloned().unwrap_or_else(|| Encounter::new(patient, now)),
            enrollments: enrollments.to_vec(),
            frames: Vec::new(),
            summary: SubmissionSummary::default(),
        }
    }

    /// Applies every element and returns the complete new state.
    ///
    /// Encounter details go first so new facts are timestamped with the submitted encounter date.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` if a submitted value cannot be read; callers validate
    /// first, so this indicates a request that changed between validation and submission.
    pub fn apply(mut self, elements: &[FormElement]) -> FormResult<EncounterChanges> {
        for element in elements {
            match element {
                FormElement::EncounterDate { field_name } => self.apply_encounter_date(field_name)?,
                FormElement::EncounterLocation(e) => {
                    self.encounter.location = match self.value(&e.field_name)? {
                        Some(WidgetValue::Reference(id)) => Some(LocationId::new(id)),
                        _ => None,
                    };
                }
                FormElement::EncounterProvider(e) => {
                    self.encounter.provider = match self.value(&e.field_name)? {
                        Some(WidgetValue::Reference(id)) => Some(PersonId::new(id)),
                        _ => None,
                    };
                }
                _ => {}
            }
        }

        for element in elements {
            match element {
                FormElement::Obs(e) => self.apply_obs(e)?,
                FormElement::GroupStart(e) => self.open_group(e),
                FormElement::GroupEnd => self.close_group(),
                FormElement::EnrollInProgram(e) => self.apply_enrollment(e)?,
                FormElement::WorkflowState(e) => self.apply_workflow_state(e)?,
                FormElement::Order(e) => self.apply_order(e)?,
                FormElement::EncounterDate { .. }
                | FormElement::EncounterLocation(_)
                | FormElement::EncounterProvider(_) => {}
            }
        }

        if self.context.mode() == Mode::Edit
            && !self.encounter.has_active_data()
            && self.encounter.voided.is_none()
        {
            tracing::debug!("encounter {} has no active data left; voiding it", self.encounter.id);
            self.encounter.voided = Some(VoidInfo {
                reason: EMPTY_ENCOUNTER_VOID_REASON.to_owned(),
                ..self.void_info.clone()
            });
            self.summary.encounter_voided = true;
        }

        Ok(EncounterChanges {
            encounter: self.encounter,
            enrollments: self.enrollments,
            summary: self.summary,
        })
    }

    fn value(&self, field_name: &str) -> FormResult<Option<WidgetValue>> {
        parse_field(self.context, self.submission, field_name, self.now)
            .map_err(|message| FormError::InvalidInput(format!("{field_name}: {message}")))
    }

    fn apply_encounter_date(&mut self, field_name: &str) -> FormResult<()> {
        let current = self.encounter.encounter_datetime;
        let when = match self.value(field_name)? {
            Some(WidgetValue::Date(date)) if date == current.date() => return Ok(()),
            Some(WidgetValue::Date(date)) if self.context.mode() == Mode::Enter => date.and_time(NaiveTime::MIN),
            Some(WidgetValue::Date(date)) => date.and_time(current.time()),
            Some(WidgetValue::Datetime(datetime)) => datetime,
            _ => return Ok(()),
        };
        if when != current {
            tracing::debug!("moving encounter {} to {when}", self.encounter.id);
            self.encounter.move_to(when);
        }
        Ok(())
    }

    fn new_obs(&self, element: &ObsElement, value: FactValue) -> Obs {
        let mut obs = Obs::new(element.concept, Some(value), self.encounter.encounter_datetime);
        obs.form_path = element.control_id.as_deref().map(|control_id| {
            FormPath::for_control(
                self.config.form_namespace(),
                self.config.form_name(),
                self.config.form_version(),
                control_id,
            )
        });
        obs
    }

    /// Puts a new observation into the currently open group, or at the encounter root.
    fn attach(&mut self, obs: Obs) {
        match self.frames.last_mut() {
            Some(frame) => frame.added.push(obs),
            None => self.encounter.obs.push(obs),
        }
    }

    fn void_obs(&mut self, id: FactId) {
        let info = self.void_info.clone();
        let Some(obs) = self.encounter.find_obs_mut(id) else {
            tracing::warn!("stored fact {id} is not part of the encounter; nothing to void");
            return;
        };
        if obs.is_voided() {
            return;
        }
        obs.void(&info);
        self.summary.voided += 1;
        if let Some(frame) = self.frames.last_mut() {
            frame.voided += 1;
        }
    }

    fn apply_obs(&mut self, element: &ObsElement) -> FormResult<()> {
        let value = self
            .value(&element.field_name)?
            .and_then(WidgetValue::into_fact_value);
        match (&element.existing, value) {
            (None, None) => {}
            (None, Some(value)) => {
                tracing::debug!("CREATE {} concept {}", element.field_name, element.concept);
                let obs = self.new_obs(element, value);
                self.attach(obs);
                self.summary.created += 1;
            }
            (Some(old), None) => {
                tracing::debug!("VOID {} fact {}", element.field_name, old.id);
                self.void_obs(old.id);
            }
            (Some(old), Some(value)) if old.value.as_ref() == Some(&value) => {
                tracing::debug!("SAME {} fact {}", element.field_name, old.id);
                self.summary.unchanged += 1;
            }
            (Some(old), Some(value)) => {
                tracing::debug!("CHANGED {} fact {}", element.field_name, old.id);
                self.void_obs(old.id);
                let mut replacement = self.new_obs(element, value);
                replacement.previous_version = Some(old.id);
                if replacement.form_path.is_none() {
                    replacement.form_path = old.form_path.clone();
                }
                self.attach(replacement);
                self.summary.created += 1;
            }
        }
        Ok(())
    }

    fn open_group(&mut self, element: &GroupElement) {
        let existing = element.existing.as_ref().map(|g| g.id);
        let active_before = existing
            .and_then(|id| self.encounter.find_obs(id))
            .map_or(0, |g| g.active_members().count());
        self.frames.push(GroupFrame {
            concept: element.concept,
            existing,
            active_before,
            voided: 0,
            added: Vec::new(),
        });
    }

    fn close_group(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        match frame.existing {
            Some(id) if !frame.added.is_empty() => {
                if let Some(group) = self.encounter.find_obs_mut(id) {
                    group.members.extend(frame.added);
                }
            }
            Some(id) if frame.active_before > 0 && frame.voided >= frame.active_before => {
                tracing::debug!("VOID group {id}: every member was cleared");
                self.void_obs(id);
            }
            Some(_) => {}
            None if frame.added.is_empty() => {}
            None => {
                tracing::debug!("CREATE group of concept {}", frame.concept);
                let mut group = Obs::group(frame.concept, self.encounter.encounter_datetime);
                group.members = frame.added;
                self.attach(group);
                self.summary.created += 1;
            }
        }
    }

    fn apply_enrollment(&mut self, element: &EnrollmentElement) -> FormResult<()> {
        if element.enrolled || self.value(&element.field_name)?.is_none() {
            return Ok(());
        }
        let date = match &element.date_field {
            Some(field) => match self.value(field)? {
                Some(WidgetValue::Date(date)) => date,
                _ => self.encounter.encounter_datetime.date(),
            },
            None => self.encounter.encounter_datetime.date(),
        };
        if self
            .enrollments
            .iter()
            .any(|e| e.program == element.program && e.is_active_on(date))
        {
            return Ok(());
        }
        tracing::debug!("ENROLL in program {} on {date}", element.program);
        self.enrollments
            .push(ProgramEnrollment::new(self.encounter.patient, element.program, date));
        self.summary.enrollments_changed += 1;
        Ok(())
    }

    fn apply_workflow_state(&mut self, element: &WorkflowStateElement) -> FormResult<()> {
        let Some(WidgetValue::Reference(state)) = self.value(&element.field_name)? else {
            return Ok(());
        };
        let state = WorkflowStateId::new(state);
        if element.current == Some(state) {
            return Ok(());
        }
        let date = self.encounter.encounter_datetime.date();
        let position = self
            .enrollments
            .iter()
            .position(|e| e.program == element.program && e.is_active_on(date));
        let enrollment = match position {
            Some(i) => &mut self.enrollments[i],
            None => {
                self.enrollments
                    .push(ProgramEnrollment::new(self.encounter.patient, element.program, date));
                let last = self.enrollments.len() - 1;
                &mut self.enrollments[last]
            }
        };
        tracing::debug!("TRANSITION workflow {} to state {state} on {date}", element.workflow);
        enrollment.transition(element.workflow, state, date);
        self.summary.enrollments_changed += 1;
        Ok(())
    }

    fn apply_order(&mut self, element: &OrderElement) -> FormResult<()> {
        let checked = self.value(&element.field_name)?.is_some();
        match (&element.existing, checked) {
            (None, true) => {
                tracing::debug!("CREATE order concept {}", element.concept);
                self.encounter.orders.push(Order {
                    id: FactId::new(),
                    concept: element.concept,
                    start_date: self.encounter.encounter_datetime,
                    voided: None,
                    form_path: None,
                });
                self.summary.created += 1;
            }
            (Some(old), false) => {
                tracing::debug!("VOID order {}", old.id);
                if let Some(order) = self.encounter.orders.iter_mut().find(|o| o.id == old.id) {
                    order.voided = Some(self.void_info.clone());
                    self.summary.voided += 1;
                }
            }
            (Some(_), true) => self.summary.unchanged += 1,
            (None, false) => {}
        }
        Ok(())
    }
}

/// Voids everything in `encounter` that `schema` could have produced, then the encounter.
pub fn retire_encounter(
    encounter: &Encounter,
    enrollments: &[ProgramEnrollment],
    schema: &FormSchema,
    void_info: &VoidInfo,
) -> EncounterChanges {
    let mut encounter = encounter.clone();
    let mut summary = SubmissionSummary::default();
    let obs_concepts = schema.top_level_obs_concepts();
    let order_concepts = schema.order_concepts();

    for obs in encounter
        .obs
        .iter_mut()
        .filter(|o| !o.is_voided() && obs_concepts.contains(&o.concept))
    {
        obs.void(void_info);
        summary.voided += 1;
    }
    for order in encounter
        .orders
        .iter_mut()
        .filter(|o| !o.is_voided() && order_concepts.contains(&o.concept))
    {
        order.voided = Some(void_info.clone());
        summary.voided += 1;
    }
    if encounter.voided.is_none() {
        encounter.voided = Some(void_info.clone());
        summary.encounter_voided = true;
    }
    tracing::debug!("retired encounter {} ({} facts voided)", encounter.id, summary.voided);

    EncounterChanges {
        encounter,
        enrollments: enrollments.to_vec(),
        summary,
    }
}
