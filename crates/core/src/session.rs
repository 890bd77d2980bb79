//! Form entry sessions.
//!
//! A [`FormEntrySession`] runs the whole pipeline once when it is opened: text preprocessing,
//! parsing, conditional blocks, repeats, reconciliation against the stored encounter and
//! compilation. The rendered HTML, the schema and the widget registry are then kept for the
//! lifetime of the session so a submission is interpreted against exactly what was rendered.

use crate::compiler::{self, declared_control_ids, CompileInput, CompiledForm, OBS_GROUP};
use crate::config::CoreConfig;
use crate::context::{FormContext, Mode};
use crate::element::FormElement;
use crate::error::FieldError;
use crate::expression::EvaluationContext;
use crate::fact::{Encounter, ProgramEnrollment, VoidInfo};
use crate::metadata::MetadataResolver;
use crate::reconcile::Reconciler;
use crate::repository::{EncounterChanges, FactRepository};
use crate::schema::FormSchema;
use crate::subject::Subject;
use crate::submission::{self, Submission, SubmissionActions};
use crate::template::conditional::resolve_conditionals;
use crate::template::repeat::{expand_dynamic_repeats, expand_static_repeats, DynamicRepeat, REPEAT};
use crate::template::{self, Element};
use crate::{FormError, FormResult};
use chrono::NaiveDateTime;
use formentry_types::{ConceptId, PersonId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything needed to open a session, owned so it can be built up and handed over.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub template: String,
    pub mode: Mode,
    pub subject: Subject,
    pub encounter: Option<Encounter>,
    pub enrollments: Vec<ProgramEnrollment>,
    /// A failed submission to redisplay, with its errors.
    pub submission: Option<Submission>,
    pub errors: Vec<FieldError>,
    pub session_attributes: BTreeMap<String, String>,
    /// The acting user, recorded on voids.
    pub user: Option<PersonId>,
    pub now: NaiveDateTime,
}

impl SessionRequest {
    pub fn new(template: impl Into<String>, mode: Mode, subject: Subject, now: NaiveDateTime) -> Self {
        Self {
            template: template.into(),
            mode,
            subject,
            encounter: None,
            enrollments: Vec::new(),
            submission: None,
            errors: Vec::new(),
            session_attributes: BTreeMap::new(),
            user: None,
            now,
        }
    }

    pub fn with_encounter(mut self, encounter: Encounter) -> Self {
        self.encounter = Some(encounter);
        self
    }

    pub fn with_enrollments(mut self, enrollments: Vec<ProgramEnrollment>) -> Self {
        self.enrollments = enrollments;
        self
    }

    /// Redisplay `submission` with its validation `errors`.
    pub fn with_submission(mut self, submission: Submission, errors: Vec<FieldError>) -> Self {
        self.submission = Some(submission);
        self.errors = errors;
        self
    }

    pub fn with_session_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: PersonId) -> Self {
        self.user = Some(user);
        self
    }
}

/// Result of [`FormEntrySession::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Validation failed; nothing was stored.
    Invalid(Vec<FieldError>),
    /// The changes were committed.
    Saved(EncounterChanges),
}

/// A compiled form bound to one subject and, optionally, one stored encounter.
pub struct FormEntrySession {
    cfg: Arc<CoreConfig>,
    request: SessionRequest,
    context: FormContext,
    compiled: CompiledForm,
}

impl std::fmt::Debug for FormEntrySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormEntrySession")
            .field("form", &self.cfg.form_name())
            .field("mode", &self.request.mode)
            .field("widgets", &self.context.widgets().len())
            .finish()
    }
}

impl FormEntrySession {
    /// Opens a session and renders its form.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Configuration resolved at startup.
    /// * `resolver` - Metadata lookup for concepts, locations, persons and programs.
    /// * `request` - The template, mode, subject and stored data to render against.
    ///
    /// # Errors
    ///
    /// Returns a `FormError` if the template is malformed, references unknown metadata,
    /// declares a control id twice, or the stored encounter has several active facts sharing
    /// one control id.
    pub fn open(cfg: Arc<CoreConfig>, resolver: Arc<dyn MetadataResolver>, request: SessionRequest) -> FormResult<Self> {
        if request.encounter.is_none() && request.mode.shows_existing_data() {
            return Err(FormError::InvalidInput(format!(
                "{} mode requires a stored encounter",
                request.mode
            )));
        }

        let mut root = template::parse(&template::preprocess(&request.template))?;
        resolve_conditionals(
            &mut root,
            &EvaluationContext {
                subject: &request.subject,
                today: request.now.date(),
                mode: request.mode,
            },
        )?;
        expand_static_repeats(&mut root)?;

        let mut reconciler = Reconciler::new(request.encounter.as_ref());
        let fixed_groups = fixed_group_concepts(&root, resolver.as_ref());
        expand_dynamic_repeats(&mut root, &mut |repeat, body| {
            repeat_count(repeat, body, &request, resolver.as_ref(), &reconciler, &fixed_groups)
        })?;

        let control_ids = declared_control_ids(&root);
        reconciler.reserve(control_ids.iter().cloned());
        let mut context = FormContext::new(request.mode, reconciler);
        for control_id in &control_ids {
            context.declare_control_id(control_id)?;
        }

        let input = CompileInput {
            config: &cfg,
            resolver: resolver.as_ref(),
            subject: &request.subject,
            encounter: request.encounter.as_ref(),
            enrollments: &request.enrollments,
            submission: request.submission.as_ref(),
            errors: &request.errors,
            session_attributes: &request.session_attributes,
            now: request.now,
        };
        let compiled = compiler::compile(&root, input, &mut context)?;

        if context.is_guessing() {
            tracing::debug!("form '{}' was reconciled by guessing", cfg.form_name());
        }
        tracing::info!(
            "opened form '{}' in {} mode for person {}",
            cfg.form_name(),
            request.mode,
            request.subject.person_id
        );

        Ok(Self {
            cfg,
            request,
            context,
            compiled,
        })
    }

    pub fn html(&self) -> &str {
        &self.compiled.html
    }

    pub fn schema(&self) -> &FormSchema {
        &self.compiled.schema
    }

    pub fn context(&self) -> &FormContext {
        &self.context
    }

    pub fn elements(&self) -> &[FormElement] {
        &self.compiled.elements
    }

    pub fn mode(&self) -> Mode {
        self.request.mode
    }

    /// Whether reconciliation had to pick between indistinguishable stored groups or facts.
    pub fn is_guessing(&self) -> bool {
        self.context.is_guessing()
    }

    /// Validates `submission` against the rendered widgets.
    ///
    /// # Returns
    ///
    /// Every field error; empty when the submission can be applied.
    pub fn validate(&self, submission: &Submission) -> Vec<FieldError> {
        submission::validate(
            &self.context,
            &self.compiled.elements,
            submission,
            self.fallback_encounter_date(),
            self.request.now,
        )
    }

    /// Validates and applies `submission`, committing the result once.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` in VIEW mode, and `FormError::Storage` if the
    /// repository rejects the commit; in that case nothing was stored.
    pub fn submit(&self, submission: &Submission, repository: &mut dyn FactRepository) -> FormResult<SubmissionOutcome> {
        if self.request.mode == Mode::View {
            return Err(FormError::InvalidInput("a form opened in VIEW mode cannot be submitted".into()));
        }

        let errors = self.validate(submission);
        if !errors.is_empty() {
            tracing::debug!("submission rejected with {} field errors", errors.len());
            return Ok(SubmissionOutcome::Invalid(errors));
        }

        let changes = SubmissionActions::new(
            &self.cfg,
            &self.context,
            submission,
            self.request.subject.person_id,
            self.request.encounter.as_ref(),
            &self.request.enrollments,
            self.request.user,
            self.request.now,
        )
        .apply(&self.compiled.elements)?;

        repository.commit(&changes)?;
        tracing::info!(
            "saved encounter {}: {} created, {} voided, {} unchanged",
            changes.encounter.id,
            changes.summary.created,
            changes.summary.voided,
            changes.summary.unchanged
        );
        Ok(SubmissionOutcome::Saved(changes))
    }

    /// Voids every active fact this form could have produced, then the encounter itself.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` if the session has no stored encounter, and
    /// `FormError::Storage` if the repository rejects the commit.
    pub fn retire_encounter(&self, repository: &mut dyn FactRepository) -> FormResult<EncounterChanges> {
        let encounter = self
            .request
            .encounter
            .as_ref()
            .ok_or_else(|| FormError::InvalidInput("there is no stored encounter to retire".into()))?;
        let void_info = VoidInfo {
            reason: self.cfg.void_reason().to_owned(),
            voided_by: self.request.user,
            voided_at: self.request.now,
        };
        let changes = submission::retire_encounter(encounter, &self.request.enrollments, self.schema(), &void_info);
        repository.commit(&changes)?;
        Ok(changes)
    }

    fn fallback_encounter_date(&self) -> chrono::NaiveDate {
        self.request
            .encounter
            .as_ref()
            .map_or(self.request.now.date(), |e| e.encounter_datetime.date())
    }
}

/// Grouping concepts of the top-level obs groups that sit outside any dynamic repeat.
fn fixed_group_concepts(root: &Element, resolver: &dyn MetadataResolver) -> Vec<ConceptId> {
    fn walk(element: &Element, resolver: &dyn MetadataResolver, out: &mut Vec<ConceptId>) {
        for child in element.child_elements() {
            if child.name == REPEAT {
                continue;
            }
            if child.name == OBS_GROUP {
                // Unknown references fail later, when the group itself compiles.
                if let Some(concept) = child
                    .non_empty_attribute("groupingConceptId")
                    .and_then(|r| resolver.concept(r))
                {
                    out.push(concept.id);
                }
                continue;
            }
            walk(child, resolver, out);
        }
    }
    let mut out = Vec::new();
    walk(root, resolver, &mut out);
    out
}

/// How many copies of a dynamic repeat to render.
///
/// A submitted count wins, so rows the user added survive a redisplay. Otherwise the stored
/// encounter decides, through the first obs group in the body: one copy per stored group of that
/// concept, less the groups the fixed obs groups of the form will take.
fn repeat_count(
    repeat: &DynamicRepeat,
    body: &Element,
    request: &SessionRequest,
    resolver: &dyn MetadataResolver,
    reconciler: &Reconciler,
    fixed_groups: &[ConceptId],
) -> FormResult<usize> {
    if let Some(raw) = request
        .submission
        .as_ref()
        .and_then(|s| s.get(&repeat.count_field_name()))
    {
        return Ok(raw.trim().parse().unwrap_or(repeat.min));
    }
    if !request.mode.shows_existing_data() {
        return Ok(repeat.min);
    }

    let mut grouping = None;
    body.visit(&mut |e| {
        if grouping.is_none() && e.name == OBS_GROUP {
            grouping = e.non_empty_attribute("groupingConceptId").map(str::to_owned);
        }
    });
    let Some(reference) = grouping else {
        return Ok(repeat.min);
    };
    let concept = resolver.concept(&reference).ok_or_else(|| FormError::UnknownConcept {
        tag: OBS_GROUP.to_owned(),
        reference: reference.clone(),
    })?;
    let fixed = fixed_groups.iter().filter(|c| **c == concept.id).count();
    Ok(reconciler.stored_group_count(concept.id).saturating_sub(fixed))
}
