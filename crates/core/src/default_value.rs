//! Default values for new forms.
//!
//! A tag's `default`/`defaultValue` attribute names where the value comes from: `now` or
//! `today`, `session:<name>`, `global:<name>`, or anything else taken literally. Every source is
//! resolved through [`DefaultValueSources::resolve`], which yields the raw text a user would
//! have typed; the widget then parses it like a submission.

use crate::config::CoreConfig;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

const SESSION_PREFIX: &str = "session:";
const GLOBAL_PREFIX: &str = "global:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValueSource {
    Literal(String),
    Now,
    Today,
    /// A named attribute of the user's session.
    Session(String),
    /// A named global property from the core configuration.
    Global(String),
}

impl DefaultValueSource {
    pub fn parse(attribute: &str) -> Self {
        let trimmed = attribute.trim();
        if trimmed.eq_ignore_ascii_case("now") {
            Self::Now
        } else if trimmed.eq_ignore_ascii_case("today") {
            Self::Today
        } else if let Some(name) = trimmed.strip_prefix(SESSION_PREFIX) {
            Self::Session(name.trim().to_owned())
        } else if let Some(name) = trimmed.strip_prefix(GLOBAL_PREFIX) {
            Self::Global(name.trim().to_owned())
        } else {
            Self::Literal(attribute.to_owned())
        }
    }
}

/// How a date-like default should be written for the widget receiving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateShape {
    Date,
    Datetime,
}

/// Everything a default value can be looked up in.
#[derive(Debug, Clone, Copy)]
pub struct DefaultValueSources<'a> {
    pub now: NaiveDateTime,
    pub session: &'a BTreeMap<String, String>,
    pub config: &'a CoreConfig,
}

impl DefaultValueSources<'_> {
    /// The raw text of `source`, or `None` when the named attribute or property is not set.
    pub fn resolve(&self, source: &DefaultValueSource, shape: DateShape) -> Option<String> {
        let resolved = match source {
            DefaultValueSource::Literal(text) => Some(text.clone()),
            DefaultValueSource::Now if shape == DateShape::Datetime => {
                Some(self.now.format("%Y-%m-%dT%H:%M").to_string())
            }
            DefaultValueSource::Now | DefaultValueSource::Today => {
                Some(self.now.date().format("%Y-%m-%d").to_string())
            }
            DefaultValueSource::Session(name) => self.session.get(name).cloned(),
            DefaultValueSource::Global(name) => self.config.global_property(name).map(str::to_owned),
        };
        if resolved.is_none() {
            tracing::debug!("default value source {source:?} is not set");
        }
        resolved
    }
}
