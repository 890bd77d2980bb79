//! Validating and applying submitted forms.

mod common;

use common::*;
use formentry_core::constants::EMPTY_ENCOUNTER_VOID_REASON;
use formentry_core::{
    FactRepository, FactValue, FormError, InMemoryFactRepository, Mode, StorageError, SubmissionOutcome,
};
use formentry_types::{PersonId, ProgramId};

const VITALS: &str = r#"
<htmlform>
    <!-- vitals -->
    <section headerLabel="Vitals">
        <encounterDate/>
        <obs conceptId="5089" labelText="Weight"/>
        <obs conceptId="3000" style="textarea"/>
    </section>
    <obsgroup groupingConceptId="7000">
        <obs conceptId="1000" answerConceptIds="1001,1002"/>
        <obs conceptId="1010"/>
    </obsgroup>
</htmlform>
"#;

fn stored_vitals() -> formentry_core::Encounter {
    let mut encounter = new_encounter();
    encounter.obs.push(numeric(WEIGHT, 70.5));
    encounter.obs.push(text(NOTES, "stable"));
    encounter.obs.push(group(
        DIAGNOSIS_CONSTRUCT,
        vec![coded(DIAGNOSIS, MALARIA), coded(CERTAINTY, CONFIRMED)],
    ));
    encounter
}

fn saved(outcome: SubmissionOutcome) -> formentry_core::EncounterChanges {
    match outcome {
        SubmissionOutcome::Saved(changes) => changes,
        SubmissionOutcome::Invalid(errors) => panic!("unexpected field errors: {errors:?}"),
    }
}

#[test]
fn test_unchanged_resubmission_creates_and_voids_nothing() {
    let encounter = stored_vitals();
    let session = open_existing(VITALS, Mode::Edit, &encounter);
    let mut repository = InMemoryFactRepository::new().with_encounter(encounter.clone());

    let changes = saved(session.submit(&echo(&session), &mut repository).expect("submits"));

    assert_eq!(changes.summary.created, 0);
    assert_eq!(changes.summary.voided, 0);
    assert_eq!(changes.summary.unchanged, 4);
    assert!(!changes.summary.encounter_voided);
    assert_eq!(changes.encounter, encounter);
    assert_eq!(repository.commits(), 1);
}

#[test]
fn test_unchanged_resubmission_of_every_widget_kind() {
    let template = r#"
<htmlform>
    <obs conceptId="4000" style="checkbox" answerLabel="Referred"/>
    <obs conceptId="4001"/>
    <obs conceptId="4100"/>
    <obs conceptId="4200"/>
</htmlform>
"#;
    let mut encounter = new_encounter();
    encounter.obs.push(boolean(REFERRED, true));
    encounter.obs.push(boolean(SMOKER, false));
    let onset = chrono::NaiveDate::from_ymd_opt(2024, 2, 20).expect("valid date");
    encounter.obs.push(formentry_core::Obs::new(c(ONSET_DATE), Some(FactValue::Date(onset)), encounter_time()));
    let seen = onset.and_hms_opt(8, 15, 42).expect("valid time");
    encounter.obs.push(formentry_core::Obs::new(c(SEEN_AT), Some(FactValue::Datetime(seen)), encounter_time()));
    let session = open_existing(template, Mode::Edit, &encounter);
    let mut repository = InMemoryFactRepository::new().with_encounter(encounter.clone());

    let changes = saved(session.submit(&echo(&session), &mut repository).expect("submits"));

    assert_eq!(changes.summary.created, 0);
    assert_eq!(changes.summary.voided, 0);
    assert_eq!(changes.summary.unchanged, 4);
    assert!(!changes.summary.encounter_voided);
    assert_eq!(changes.encounter, encounter);
}

#[test]
fn test_checkbox_leaves_a_stored_false_alone() {
    let template = r#"<htmlform><obs conceptId="4000" style="checkbox"/></htmlform>"#;
    let mut encounter = new_encounter();
    encounter.obs.push(boolean(REFERRED, false));
    let session = open_existing(template, Mode::Edit, &encounter);
    assert_eq!(obs_assignments(&session), vec![None]);
    let mut repository = InMemoryFactRepository::new().with_encounter(encounter.clone());

    let changes = saved(session.submit(&echo(&session), &mut repository).expect("submits"));

    assert_eq!(changes.summary.created, 0);
    assert_eq!(changes.summary.voided, 0);
    assert!(!changes.summary.encounter_voided);
    assert_eq!(changes.encounter, encounter);
}

#[test]
fn test_new_form_creates_facts_and_groups() {
    let session = open_new(VITALS);
    let mut submission = formentry_core::Submission::new();
    submission.insert(session.elements().iter().find_map(encounter_date_field).expect("date field"), "2024-03-14".into());
    submission.insert(obs_fields(&session, WEIGHT)[0].clone(), "64".into());
    submission.insert(obs_fields(&session, DIAGNOSIS)[0].clone(), TUBERCULOSIS.to_string());
    let mut repository = InMemoryFactRepository::new();

    let changes = saved(session.submit(&submission, &mut repository).expect("submits"));

    let encounter = &changes.encounter;
    assert_eq!(encounter.encounter_datetime, at(2024, 3, 14, 0, 0));
    assert_eq!(encounter.patient, PersonId::new(7));
    assert_eq!(encounter.obs.len(), 2);
    assert_eq!(encounter.obs[0].value, Some(FactValue::Numeric(64.0)));
    let diagnosis = &encounter.obs[1];
    assert_eq!(diagnosis.concept, c(DIAGNOSIS_CONSTRUCT));
    assert_eq!(diagnosis.members.len(), 1);
    assert_eq!(diagnosis.members[0].value, Some(FactValue::Coded(c(TUBERCULOSIS))));
    assert_eq!(changes.summary.created, 3);
    assert!(encounter
        .all_obs()
        .iter()
        .all(|o| o.obs_datetime == at(2024, 3, 14, 0, 0)));
}

fn encounter_date_field(element: &formentry_core::element::FormElement) -> Option<String> {
    match element {
        formentry_core::element::FormElement::EncounterDate { field_name } => Some(field_name.clone()),
        _ => None,
    }
}

#[test]
fn test_empty_group_is_not_created() {
    let session = open_new(VITALS);
    let mut submission = formentry_core::Submission::new();
    submission.insert(session.elements().iter().find_map(encounter_date_field).expect("date field"), "2024-03-14".into());
    submission.insert(obs_fields(&session, WEIGHT)[0].clone(), "64".into());

    let changes = saved(session.submit(&submission, &mut InMemoryFactRepository::new()).expect("submits"));

    assert_eq!(changes.encounter.obs.len(), 1);
    assert_eq!(changes.summary.created, 1);
}

#[test]
fn test_changed_value_voids_and_links_replacement() {
    let encounter = stored_vitals();
    let old_weight = encounter.obs[0].id;
    let session = open_existing(VITALS, Mode::Edit, &encounter);
    let mut submission = echo(&session);
    submission.insert(obs_fields(&session, WEIGHT)[0].clone(), "72".into());

    let changes = saved(session.submit(&submission, &mut InMemoryFactRepository::new()).expect("submits"));

    assert_eq!(changes.summary.created, 1);
    assert_eq!(changes.summary.voided, 1);
    let old = changes.encounter.find_obs(old_weight).expect("old fact kept");
    assert!(old.is_voided());
    let replacement = changes
        .encounter
        .active_obs()
        .find(|o| o.concept == c(WEIGHT))
        .expect("replacement stored");
    assert_eq!(replacement.previous_version, Some(old_weight));
    assert_eq!(replacement.value, Some(FactValue::Numeric(72.0)));
    let chain: Vec<_> = changes.encounter.revision_chain(replacement.id).iter().map(|o| o.id).collect();
    assert_eq!(chain, vec![replacement.id, old_weight]);
}

#[test]
fn test_clearing_one_member_and_changing_its_sibling() {
    let template = r#"<htmlform><obsgroup groupingConceptId="7100"><obs conceptId="3000"/><obs conceptId="5089"/></obsgroup></htmlform>"#;
    let mut encounter = new_encounter();
    encounter.obs.push(group(SYMPTOM_CONSTRUCT, vec![text(NOTES, "cough"), numeric(WEIGHT, 60.0)]));
    let stored_group = encounter.obs[0].id;
    let (old_notes, old_weight) = (encounter.obs[0].members[0].id, encounter.obs[0].members[1].id);
    let session = open_existing(template, Mode::Edit, &encounter);
    let mut submission = echo(&session);
    submission.remove(&obs_fields(&session, NOTES)[0]);
    submission.insert(obs_fields(&session, WEIGHT)[0].clone(), "62".into());

    let changes = saved(session.submit(&submission, &mut InMemoryFactRepository::new()).expect("submits"));

    assert_eq!(changes.summary.created, 1);
    let group = changes.encounter.find_obs(stored_group).expect("group kept");
    assert!(!group.is_voided());
    assert!(changes.encounter.find_obs(old_notes).is_some_and(|o| o.is_voided()));
    assert!(changes.encounter.find_obs(old_weight).is_some_and(|o| o.is_voided()));
    let active: Vec<_> = group.active_members().collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].value, Some(FactValue::Numeric(62.0)));
    assert_eq!(active[0].previous_version, Some(old_weight));
}

#[test]
fn test_clearing_every_member_voids_the_group() {
    let template = r#"<htmlform><obs conceptId="5089"/><obsgroup groupingConceptId="7100"><obs conceptId="3000"/></obsgroup></htmlform>"#;
    let mut encounter = new_encounter();
    encounter.obs.push(numeric(WEIGHT, 60.0));
    encounter.obs.push(group(SYMPTOM_CONSTRUCT, vec![text(NOTES, "cough")]));
    let stored_group = encounter.obs[1].id;
    let session = open_existing(template, Mode::Edit, &encounter);
    let mut submission = echo(&session);
    submission.remove(&obs_fields(&session, NOTES)[0]);

    let changes = saved(session.submit(&submission, &mut InMemoryFactRepository::new()).expect("submits"));

    assert!(changes.encounter.find_obs(stored_group).is_some_and(|g| g.is_voided()));
    assert!(!changes.summary.encounter_voided);
}

#[test]
fn test_clearing_everything_voids_the_encounter() {
    let template = r#"<htmlform><obs conceptId="5089"/></htmlform>"#;
    let mut encounter = new_encounter();
    encounter.obs.push(numeric(WEIGHT, 60.0));
    let session = open_existing(template, Mode::Edit, &encounter);

    let changes = saved(
        session
            .submit(&formentry_core::Submission::new(), &mut InMemoryFactRepository::new())
            .expect("submits"),
    );

    assert!(changes.summary.encounter_voided);
    assert_eq!(
        changes.encounter.voided.as_ref().map(|v| v.reason.as_str()),
        Some(EMPTY_ENCOUNTER_VOID_REASON)
    );
}

#[test]
fn test_required_empty_field_on_new_form() {
    let template = r#"<htmlform><obs conceptId="5089" required="true"/><obs conceptId="3000"/></htmlform>"#;
    let session = open_new(template);
    let mut repository = InMemoryFactRepository::new();

    let outcome = session
        .submit(&formentry_core::Submission::new(), &mut repository)
        .expect("submits");

    let SubmissionOutcome::Invalid(errors) = outcome else {
        panic!("expected field errors");
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_name, obs_fields(&session, WEIGHT)[0]);
    assert_eq!(errors[0].message, "Required");
    assert_eq!(repository.commits(), 0);
}

#[test]
fn test_every_invalid_field_is_reported() {
    let template = r#"<htmlform><encounterDate/><obs conceptId="5089"/><obs conceptId="1000" answerConceptIds="1001"/></htmlform>"#;
    let session = open_new(template);
    let mut submission = formentry_core::Submission::new();
    submission.insert(obs_fields(&session, WEIGHT)[0].clone(), "900".into());
    submission.insert(obs_fields(&session, DIAGNOSIS)[0].clone(), INFLUENZA.to_string());

    let errors = session.validate(&submission);

    let fields: Vec<_> = errors.iter().map(|e| e.field_name.as_str()).collect();
    let date_field = session.elements().iter().find_map(encounter_date_field).expect("date field");
    assert_eq!(
        fields,
        vec![
            date_field.as_str(),
            obs_fields(&session, WEIGHT)[0].as_str(),
            obs_fields(&session, DIAGNOSIS)[0].as_str()
        ]
    );
}

#[test]
fn test_future_encounter_date_is_rejected() {
    let template = r#"<htmlform><encounterDate/></htmlform>"#;
    let session = open_new(template);
    let date_field = session.elements().iter().find_map(encounter_date_field).expect("date field");
    let submission = [(date_field.clone(), "2024-04-01".to_owned())].into();

    let errors = session.validate(&submission);

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_name, date_field);
}

#[test]
fn test_redisplay_shows_submitted_text_and_errors() {
    let template = r#"<htmlform><obs conceptId="5089"/></htmlform>"#;
    let first = open_new(template);
    let field = obs_fields(&first, WEIGHT)[0].clone();
    let submission: formentry_core::Submission = [(field.clone(), "heavy".to_owned())].into();
    let errors = first.validate(&submission);

    let redisplay = open(request(template, Mode::Enter).with_submission(submission, errors.clone())).expect("form opens");

    assert_eq!(errors[0].message, "Must be a number");
    assert!(redisplay.html().contains(r#"value="heavy""#));
    assert!(redisplay.html().contains("Must be a number"));
}

#[test]
fn test_storage_failure_leaves_nothing_behind() {
    let encounter = stored_vitals();
    let session = open_existing(VITALS, Mode::Edit, &encounter);
    let mut submission = echo(&session);
    submission.insert(obs_fields(&session, WEIGHT)[0].clone(), "72".into());
    let mut repository = InMemoryFactRepository::new().with_encounter(encounter.clone());
    repository.fail_commits = true;

    let err = session.submit(&submission, &mut repository).unwrap_err();

    assert!(matches!(err, FormError::Storage(StorageError::Backend(_))));
    assert_eq!(repository.commits(), 0);
    assert_eq!(repository.encounter(encounter.id).expect("reads"), Some(encounter.clone()));

    repository.fail_commits = false;
    let changes = saved(session.submit(&submission, &mut repository).expect("retry submits"));
    assert_eq!(changes.summary.created, 1);
    assert_eq!(repository.commits(), 1);
}

#[test]
fn test_view_mode_cannot_be_submitted() {
    let encounter = stored_vitals();
    let session = open_existing(VITALS, Mode::View, &encounter);

    let err = session
        .submit(&echo(&session), &mut InMemoryFactRepository::new())
        .unwrap_err();

    assert!(matches!(err, FormError::InvalidInput(_)));
}

#[test]
fn test_control_id_is_recorded_and_found_again() {
    let template = r#"<htmlform><obs conceptId="5089" controlId="weight"/><obs conceptId="5089"/></htmlform>"#;
    let session = open_new(template);
    let fields = obs_fields(&session, WEIGHT);
    let submission = [(fields[0].clone(), "61".to_owned()), (fields[1].clone(), "62".to_owned())].into();
    let mut repository = InMemoryFactRepository::new();

    let changes = saved(session.submit(&submission, &mut repository).expect("submits"));

    let tagged = &changes.encounter.obs[0];
    assert_eq!(tagged.form_path.as_ref().and_then(|p| p.control_id()), Some("weight"));
    assert_eq!(changes.encounter.obs[1].form_path, None);

    let mut reordered = changes.encounter.clone();
    reordered.obs.reverse();
    let edit = open_existing(template, Mode::Edit, &reordered);
    let values: Vec<_> = obs_assignments(&edit)
        .into_iter()
        .map(|o| o.and_then(|o| o.value))
        .collect();
    assert_eq!(values, vec![Some(FactValue::Numeric(61.0)), Some(FactValue::Numeric(62.0))]);
}

#[test]
fn test_encounter_date_change_moves_facts() {
    let template = r#"<htmlform><encounterDate/><obs conceptId="5089"/></htmlform>"#;
    let mut encounter = new_encounter();
    encounter.obs.push(numeric(WEIGHT, 60.0));
    let session = open_existing(template, Mode::Edit, &encounter);
    let mut submission = echo(&session);
    let date_field = session.elements().iter().find_map(encounter_date_field).expect("date field");
    submission.insert(date_field, "2024-03-02".into());

    let changes = saved(session.submit(&submission, &mut InMemoryFactRepository::new()).expect("submits"));

    assert_eq!(changes.encounter.encounter_datetime, at(2024, 3, 2, 9, 0));
    assert_eq!(changes.encounter.obs[0].obs_datetime, at(2024, 3, 2, 9, 0));
    assert_eq!(changes.summary.unchanged, 1);
}

#[test]
fn test_program_enrollment_on_submission() {
    let metadata = metadata().with_program(formentry_core::metadata::Program {
        id: ProgramId::new(3),
        uuid: None,
        name: "TB Program".into(),
        workflows: Vec::new(),
    });
    let template = r#"<htmlform><encounterDate/><enrollInProgram programId="TB Program" showDate="true"/></htmlform>"#;
    let session = formentry_core::FormEntrySession::open(
        config(),
        std::sync::Arc::new(metadata),
        request(template, Mode::Enter),
    )
    .expect("form opens");
    let encounter_date = session.elements().iter().find_map(encounter_date_field).expect("date field");
    let (checkbox, date_field) = session
        .elements()
        .iter()
        .find_map(|e| match e {
            formentry_core::element::FormElement::EnrollInProgram(e) => {
                Some((e.field_name.clone(), e.date_field.clone().expect("date shown")))
            }
            _ => None,
        })
        .expect("enrollment element");
    let submit = |enrolled_on: &str| -> formentry_core::Submission {
        [
            (encounter_date.clone(), "2024-03-05".to_owned()),
            (checkbox.clone(), "true".to_owned()),
            (date_field.clone(), enrolled_on.to_owned()),
        ]
        .into()
    };

    let errors = session.validate(&submit("2024-03-10"));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_name, date_field);
    assert_eq!(errors[0].message, "Enrollment date cannot be after the encounter date");

    let changes = saved(session.submit(&submit("2024-03-04"), &mut InMemoryFactRepository::new()).expect("submits"));
    assert_eq!(changes.enrollments.len(), 1);
    assert_eq!(changes.enrollments[0].program, ProgramId::new(3));
    assert_eq!(changes.enrollments[0].date_enrolled, at(2024, 3, 4, 0, 0).date());
    assert_eq!(changes.summary.enrollments_changed, 1);
}

#[test]
fn test_retire_encounter_voids_schema_facts_only() {
    let mut encounter = stored_vitals();
    encounter.obs.push(numeric(9999, 1.0));
    let session = open_existing(VITALS, Mode::Edit, &encounter);
    let mut repository = InMemoryFactRepository::new().with_encounter(encounter.clone());

    let changes = session.retire_encounter(&mut repository).expect("retires");

    assert!(changes.encounter.voided.is_some());
    assert_eq!(changes.summary.voided, 3);
    assert!(changes.encounter.obs[..3].iter().all(|o| o.is_voided()));
    assert!(changes.encounter.obs[2].members.iter().all(|m| m.is_voided()));
    assert!(!changes.encounter.obs[3].is_voided());
    assert_eq!(repository.commits(), 1);
}
