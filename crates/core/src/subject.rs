//! The person a form is filled in for.

use chrono::{Datelike, NaiveDate};
use formentry_types::PersonId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Subject {
    pub person_id: PersonId,
    /// Administrative gender code, e.g. `M` or `F`.
    pub gender: String,
    #[serde(default)]
    pub birthdate: Option<NaiveDate>,
    #[serde(default)]
    pub dead: bool,
    /// Free-form person attributes, exposed to script expressions by name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Subject {
    /// Age in completed years on `date`, if the birthdate is known.
    pub fn age_on(&self, date: NaiveDate) -> Option<u32> {
        let birthdate = self.birthdate?;
        if date < birthdate {
            return Some(0);
        }
        let mut years = date.year() - birthdate.year();
        if (date.month(), date.day()) < (birthdate.month(), birthdate.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }

    /// Age in completed months on `date`, if the birthdate is known.
    pub fn age_in_months_on(&self, date: NaiveDate) -> Option<u32> {
        let birthdate = self.birthdate?;
        if date < birthdate {
            return Some(0);
        }
        let mut months = (date.year() - birthdate.year()) * 12 + date.month() as i32
            - birthdate.month() as i32;
        if date.day() < birthdate.day() {
            months -= 1;
        }
        u32::try_from(months).ok()
    }
}
