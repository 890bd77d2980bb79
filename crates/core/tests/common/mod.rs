#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use formentry_core::element::FormElement;
use formentry_core::metadata::{Concept, ConceptDatatype, Location, Person};
use formentry_core::{
    CoreConfig, Encounter, FactValue, FormEntrySession, FormResult, InMemoryMetadata, Mode, Obs,
    SessionRequest, Subject, Submission,
};
use formentry_types::{ConceptId, LocationId, PersonId};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const WEIGHT: u32 = 5089;
pub const NOTES: u32 = 3000;
pub const DIAGNOSIS: u32 = 1000;
pub const MALARIA: u32 = 1001;
pub const TUBERCULOSIS: u32 = 1002;
pub const INFLUENZA: u32 = 1003;
pub const CERTAINTY: u32 = 1010;
pub const CONFIRMED: u32 = 1011;
pub const PRESUMED: u32 = 1012;
pub const DIAGNOSIS_CONSTRUCT: u32 = 7000;
pub const SYMPTOM_CONSTRUCT: u32 = 7100;
pub const REFERRED: u32 = 4000;
pub const SMOKER: u32 = 4001;
pub const ONSET_DATE: u32 = 4100;
pub const SEEN_AT: u32 = 4200;

pub fn c(id: u32) -> ConceptId {
    ConceptId::new(id)
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(h, min, 0))
        .expect("valid timestamp")
}

pub fn now() -> NaiveDateTime {
    at(2024, 3, 15, 10, 30)
}

pub fn encounter_time() -> NaiveDateTime {
    at(2024, 3, 1, 9, 0)
}

fn simple(id: u32, name: &str, datatype: ConceptDatatype) -> Concept {
    Concept {
        id: c(id),
        uuid: None,
        name: name.to_owned(),
        datatype,
        answers: Vec::new(),
        set_members: Vec::new(),
        mappings: Vec::new(),
    }
}

pub fn metadata() -> InMemoryMetadata {
    let na = || ConceptDatatype::NotApplicable;
    InMemoryMetadata::default()
        .with_concept(simple(
            WEIGHT,
            "Weight (kg)",
            ConceptDatatype::Numeric {
                low: Some(0.0),
                high: Some(250.0),
                precise: true,
            },
        ))
        .with_concept(simple(NOTES, "Notes", ConceptDatatype::Text))
        .with_concept(simple(REFERRED, "Referred", ConceptDatatype::Boolean))
        .with_concept(simple(SMOKER, "Smoker", ConceptDatatype::Boolean))
        .with_concept(simple(ONSET_DATE, "Onset date", ConceptDatatype::Date))
        .with_concept(simple(SEEN_AT, "Seen at", ConceptDatatype::Datetime))
        .with_concept(Concept {
            answers: vec![c(MALARIA), c(TUBERCULOSIS), c(INFLUENZA)],
            ..simple(DIAGNOSIS, "Diagnosis", ConceptDatatype::Coded)
        })
        .with_concept(simple(MALARIA, "Malaria", na()))
        .with_concept(simple(TUBERCULOSIS, "Tuberculosis", na()))
        .with_concept(simple(INFLUENZA, "Influenza", na()))
        .with_concept(Concept {
            answers: vec![c(CONFIRMED), c(PRESUMED)],
            ..simple(CERTAINTY, "Certainty", ConceptDatatype::Coded)
        })
        .with_concept(simple(CONFIRMED, "Confirmed", na()))
        .with_concept(simple(PRESUMED, "Presumed", na()))
        .with_concept(Concept {
            set_members: vec![c(DIAGNOSIS), c(CERTAINTY)],
            ..simple(DIAGNOSIS_CONSTRUCT, "Diagnosis construct", na())
        })
        .with_concept(Concept {
            set_members: vec![c(NOTES), c(WEIGHT)],
            ..simple(SYMPTOM_CONSTRUCT, "Symptom construct", na())
        })
        .with_location(Location {
            id: LocationId::new(1),
            uuid: None,
            name: "Outpatient Clinic".into(),
        })
        .with_provider(Person {
            id: PersonId::new(50),
            uuid: None,
            name: "Dr. Okafor".into(),
        })
}

pub fn config() -> Arc<CoreConfig> {
    Arc::new(CoreConfig::new("Vitals".into(), "1.0".into()).expect("valid config"))
}

pub fn subject() -> Subject {
    Subject {
        person_id: PersonId::new(7),
        gender: "F".into(),
        birthdate: NaiveDate::from_ymd_opt(1990, 6, 1),
        dead: false,
        attributes: BTreeMap::new(),
    }
}

pub fn request(template: &str, mode: Mode) -> SessionRequest {
    SessionRequest::new(template, mode, subject(), now())
}

pub fn open(request: SessionRequest) -> FormResult<FormEntrySession> {
    FormEntrySession::open(config(), Arc::new(metadata()), request)
}

pub fn open_new(template: &str) -> FormEntrySession {
    open(request(template, Mode::Enter)).expect("form opens")
}

pub fn open_existing(template: &str, mode: Mode, encounter: &Encounter) -> FormEntrySession {
    open(request(template, mode).with_encounter(encounter.clone())).expect("form opens")
}

pub fn new_encounter() -> Encounter {
    Encounter::new(PersonId::new(7), encounter_time())
}

pub fn numeric(concept: u32, value: f64) -> Obs {
    Obs::new(c(concept), Some(FactValue::Numeric(value)), encounter_time())
}

pub fn coded(concept: u32, answer: u32) -> Obs {
    Obs::new(c(concept), Some(FactValue::Coded(c(answer))), encounter_time())
}

pub fn text(concept: u32, value: &str) -> Obs {
    Obs::new(c(concept), Some(FactValue::Text(value.to_owned())), encounter_time())
}

pub fn boolean(concept: u32, value: bool) -> Obs {
    Obs::new(c(concept), Some(FactValue::Boolean(value)), encounter_time())
}

pub fn group(concept: u32, members: Vec<Obs>) -> Obs {
    members
        .into_iter()
        .fold(Obs::group(c(concept), encounter_time()), Obs::with_member)
}

/// What a browser posts back for a form nobody touched.
pub fn echo(session: &FormEntrySession) -> Submission {
    session
        .context()
        .widgets()
        .iter()
        .filter_map(|w| {
            w.widget
                .initial_value()
                .map(|value| (w.field_name.clone(), value.to_raw()))
        })
        .collect()
}

/// Field names of the obs tags asking `concept`, in document order.
pub fn obs_fields(session: &FormEntrySession, concept: u32) -> Vec<String> {
    session
        .elements()
        .iter()
        .filter_map(|e| match e {
            FormElement::Obs(obs) if obs.concept == c(concept) => Some(obs.field_name.clone()),
            _ => None,
        })
        .collect()
}

/// The stored group each `<obsgroup>` slot was given, in document order.
pub fn group_assignments(session: &FormEntrySession) -> Vec<Option<Obs>> {
    session
        .elements()
        .iter()
        .filter_map(|e| match e {
            FormElement::GroupStart(g) => Some(g.existing.clone()),
            _ => None,
        })
        .collect()
}

/// The stored fact each obs tag was given, in document order.
pub fn obs_assignments(session: &FormEntrySession) -> Vec<Option<Obs>> {
    session
        .elements()
        .iter()
        .filter_map(|e| match e {
            FormElement::Obs(o) => Some(o.existing.clone()),
            _ => None,
        })
        .collect()
}
