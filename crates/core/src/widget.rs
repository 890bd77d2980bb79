//! Typed render/bind units.
//!
//! A widget renders its control (ENTER/EDIT) or its value (VIEW), carries an initial value
//! seeded from reconciliation or a default, and parses a submitted string back into a
//! [`WidgetValue`]. Widgets do not know their field names; the form context assigns those.

use crate::context::Mode;
use crate::fact::FactValue;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use formentry_types::ConceptId;
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use std::fmt::Write;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M";
const DATETIME_SECONDS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATETIME_FRACTION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATETIME_INPUT_FORMATS: &[&str] = &[
    DATETIME_FORMAT,
    "%Y-%m-%d %H:%M",
    DATETIME_SECONDS_FORMAT,
    DATETIME_FRACTION_FORMAT,
    "%Y-%m-%d %H:%M:%S",
];

/// The shortest format that keeps every part of `dt`, so a stored value survives an unchanged
/// round trip through the browser.
fn datetime_format(dt: &NaiveDateTime) -> &'static str {
    if dt.nanosecond() != 0 {
        DATETIME_FRACTION_FORMAT
    } else if dt.second() != 0 {
        DATETIME_SECONDS_FORMAT
    } else {
        DATETIME_FORMAT
    }
}

/// The kind of value a widget produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Date,
    Number,
    Text,
    Coded,
    Boolean,
}

/// A typed value parsed from a submission or seeded as an initial value.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetValue {
    Date(NaiveDate),
    Datetime(NaiveDateTime),
    Number(f64),
    Coded(ConceptId),
    Text(String),
    Boolean(bool),
    /// A location, person or workflow state picked from a list.
    Reference(u32),
}

impl WidgetValue {
    /// The string a browser would submit for this value.
    pub fn to_raw(&self) -> String {
        match self {
            Self::Date(d) => d.format(DATE_FORMAT).to_string(),
            Self::Datetime(dt) => dt.format(datetime_format(dt)).to_string(),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
            Self::Coded(c) => c.to_string(),
            Self::Text(s) => s.clone(),
            Self::Boolean(b) => b.to_string(),
            Self::Reference(id) => id.to_string(),
        }
    }

    /// The observation value this widget value stores as, if any.
    pub fn into_fact_value(self) -> Option<FactValue> {
        match self {
            Self::Date(d) => Some(FactValue::Date(d)),
            Self::Datetime(dt) => Some(FactValue::Datetime(dt)),
            Self::Number(n) => Some(FactValue::Numeric(n)),
            Self::Coded(c) => Some(FactValue::Coded(c)),
            Self::Text(s) => Some(FactValue::Text(s)),
            Self::Boolean(b) => Some(FactValue::Boolean(b)),
            Self::Reference(_) => None,
        }
    }
}

impl From<FactValue> for WidgetValue {
    fn from(value: FactValue) -> Self {
        match value {
            FactValue::Coded(c) => Self::Coded(c),
            FactValue::Numeric(n) => Self::Number(n),
            FactValue::Text(s) => Self::Text(s),
            FactValue::Date(d) => Self::Date(d),
            FactValue::Datetime(dt) => Self::Datetime(dt),
            FactValue::Boolean(b) => Self::Boolean(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectStyle {
    Dropdown,
    Radio,
}

/// How the value of a select option is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Concept,
    Reference,
    Boolean,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WidgetKind {
    Text {
        rows: Option<u32>,
        cols: Option<u32>,
    },
    Number {
        min: Option<f64>,
        max: Option<f64>,
        decimals: bool,
    },
    Date {
        allow_future: bool,
    },
    Datetime {
        allow_future: bool,
    },
    Select {
        options: Vec<SelectOption>,
        style: SelectStyle,
        kind: OptionKind,
    },
    /// Checked means `value`; unchecked means no value.
    Checkbox {
        value: WidgetValue,
        label: String,
    },
    Hidden,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    kind: WidgetKind,
    initial: Option<WidgetValue>,
}

impl Widget {
    pub fn new(kind: WidgetKind) -> Self {
        Self {
            kind,
            initial: None,
        }
    }

    pub fn kind(&self) -> &WidgetKind {
        &self.kind
    }

    pub fn capability(&self) -> Capability {
        match &self.kind {
            WidgetKind::Text { .. } | WidgetKind::Hidden => Capability::Text,
            WidgetKind::Number { .. } => Capability::Number,
            WidgetKind::Date { .. } | WidgetKind::Datetime { .. } => Capability::Date,
            WidgetKind::Select {
                kind: OptionKind::Boolean,
                ..
            } => Capability::Boolean,
            WidgetKind::Select { .. } => Capability::Coded,
            WidgetKind::Checkbox { value, .. } => match value {
                WidgetValue::Boolean(_) => Capability::Boolean,
                _ => Capability::Coded,
            },
        }
    }

    pub fn initial_value(&self) -> Option<&WidgetValue> {
        self.initial.as_ref()
    }

    pub fn set_initial_value(&mut self, value: Option<WidgetValue>) {
        self.initial = value;
    }

    /// Parses a submitted string. Absent or blank input is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the user-facing message when the input cannot be read as this widget's type.
    pub fn parse(&self, raw: Option<&str>, now: NaiveDateTime) -> Result<Option<WidgetValue>, String> {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        let value = match &self.kind {
            WidgetKind::Text { .. } | WidgetKind::Hidden => WidgetValue::Text(raw.to_owned()),
            WidgetKind::Number { min, max, decimals } => {
                let n: f64 = raw.parse().map_err(|_| "Must be a number".to_owned())?;
                if !n.is_finite() {
                    return Err("Must be a number".into());
                }
                if !decimals && n.fract() != 0.0 {
                    return Err("Must be an integer".into());
                }
                check_range(n, *min, *max)?;
                WidgetValue::Number(n)
            }
            WidgetKind::Date { allow_future } => {
                let date = NaiveDate::parse_from_str(raw, DATE_FORMAT)
                    .map_err(|_| "Invalid date (expected YYYY-MM-DD)".to_owned())?;
                if !allow_future && date > now.date() {
                    return Err("Cannot be in the future".into());
                }
                WidgetValue::Date(date)
            }
            WidgetKind::Datetime { allow_future } => {
                let datetime = DATETIME_INPUT_FORMATS
                    .iter()
                    .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
                    .or_else(|| {
                        NaiveDate::parse_from_str(raw, DATE_FORMAT)
                            .ok()
                            .and_then(|d| d.and_hms_opt(0, 0, 0))
                    })
                    .ok_or_else(|| "Invalid date and time".to_owned())?;
                if !allow_future && datetime.date() > now.date() {
                    return Err("Cannot be in the future".into());
                }
                WidgetValue::Datetime(datetime)
            }
            WidgetKind::Select { options, kind, .. } => {
                if !options.iter().any(|o| o.value == raw) {
                    return Err("Invalid answer".into());
                }
                match kind {
                    OptionKind::Concept => WidgetValue::Coded(
                        raw.parse().map_err(|_| "Invalid answer".to_owned())?,
                    ),
                    OptionKind::Reference => WidgetValue::Reference(
                        raw.parse().map_err(|_| "Invalid answer".to_owned())?,
                    ),
                    OptionKind::Boolean => WidgetValue::Boolean(raw == "true"),
                }
            }
            WidgetKind::Checkbox { value, .. } => value.clone(),
        };
        Ok(Some(value))
    }

    /// Renders the widget under `field_name`.
    ///
    /// `submitted` carries the raw text of a failed submission being redisplayed (empty when the
    /// field was left blank); it takes precedence over the initial value.
    pub fn render(&self, field_name: &str, mode: Mode, submitted: Option<&str>) -> String {
        let current = match submitted {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.to_owned()),
            None => self.initial.as_ref().map(WidgetValue::to_raw),
        };
        if mode == Mode::View {
            return self.render_view(current.as_deref());
        }
        let name = attr(field_name);
        let value = current.as_deref().unwrap_or("");
        let mut out = String::new();
        match &self.kind {
            WidgetKind::Text { rows: Some(rows), cols } => {
                let _ = write!(out, r#"<textarea name="{name}" id="{name}" rows="{rows}""#);
                if let Some(cols) = cols {
                    let _ = write!(out, r#" cols="{cols}""#);
                }
                let _ = write!(out, ">{}</textarea>", text(value));
            }
            WidgetKind::Text { rows: None, .. } => {
                let _ = write!(
                    out,
                    r#"<input type="text" name="{name}" id="{name}" value="{}"/>"#,
                    attr(value)
                );
            }
            WidgetKind::Number { .. } => {
                let _ = write!(
                    out,
                    r#"<input type="text" class="number" size="5" name="{name}" id="{name}" value="{}"/>"#,
                    attr(value)
                );
            }
            WidgetKind::Date { .. } => {
                let _ = write!(
                    out,
                    r#"<input type="date" name="{name}" id="{name}" value="{}"/>"#,
                    attr(value)
                );
            }
            WidgetKind::Datetime { .. } => {
                let _ = write!(
                    out,
                    r#"<input type="datetime-local" name="{name}" id="{name}" value="{}"/>"#,
                    attr(value)
                );
            }
            WidgetKind::Select {
                options,
                style: SelectStyle::Dropdown,
                ..
            } => {
                let _ = write!(out, r#"<select name="{name}" id="{name}"><option value=""></option>"#);
                for option in options {
                    let selected = if option.value == value { r#" selected="true""# } else { "" };
                    let _ = write!(
                        out,
                        r#"<option value="{}"{selected}>{}</option>"#,
                        attr(&option.value),
                        text(&option.label)
                    );
                }
                out.push_str("</select>");
            }
            WidgetKind::Select {
                options,
                style: SelectStyle::Radio,
                ..
            } => {
                out.push_str(r#"<span class="radio-group">"#);
                for (i, option) in options.iter().enumerate() {
                    let checked = if option.value == value { r#" checked="true""# } else { "" };
                    let _ = write!(
                        out,
                        r#"<input type="radio" name="{name}" id="{name}_{i}" value="{}"{checked}/><label for="{name}_{i}">{}</label>"#,
                        attr(&option.value),
                        text(&option.label)
                    );
                }
                out.push_str("</span>");
            }
            WidgetKind::Checkbox {
                value: checked_value,
                label,
            } => {
                let checked = if current.is_some() { r#" checked="true""# } else { "" };
                let _ = write!(
                    out,
                    r#"<input type="checkbox" name="{name}" id="{name}" value="{}"{checked}/><label for="{name}">{}</label>"#,
                    attr(&checked_value.to_raw()),
                    text(label)
                );
            }
            WidgetKind::Hidden => {
                let _ = write!(
                    out,
                    r#"<input type="hidden" name="{name}" id="{name}" value="{}"/>"#,
                    attr(value)
                );
            }
        }
        out
    }

    fn render_view(&self, current: Option<&str>) -> String {
        match &self.kind {
            WidgetKind::Hidden => String::new(),
            WidgetKind::Checkbox { label, .. } => {
                let mark = if current.is_some() { "[X]" } else { "[&#160;&#160;]" };
                format!(r#"<span class="value">{mark}</span>&#160;<span class="label">{}</span>"#, text(label))
            }
            WidgetKind::Select { options, .. } => {
                let label = current
                    .and_then(|v| options.iter().find(|o| o.value == v))
                    .map(|o| o.label.as_str())
                    .or(current)
                    .unwrap_or("");
                format!(r#"<span class="value">{}</span>"#, text(label))
            }
            _ => format!(r#"<span class="value">{}</span>"#, text(current.unwrap_or(""))),
        }
    }
}

fn check_range(n: f64, min: Option<f64>, max: Option<f64>) -> Result<(), String> {
    let show = |v: f64| WidgetValue::Number(v).to_raw();
    match (min, max) {
        (Some(lo), Some(hi)) if n < lo || n > hi => {
            Err(format!("Must be between {} and {}", show(lo), show(hi)))
        }
        (Some(lo), None) if n < lo => Err(format!("Must be at least {}", show(lo))),
        (None, Some(hi)) if n > hi => Err(format!("Must be at most {}", show(hi))),
        _ => Ok(()),
    }
}

/// The placeholder element that shows validation messages for a widget.
pub fn render_error_placeholder(error_field: &str, messages: &[&str]) -> String {
    if messages.is_empty() {
        return format!(
            r#"<span class="error field-error" id="{}" style="display: none"></span>"#,
            attr(error_field)
        );
    }
    format!(
        r#"<span class="error field-error" id="{}">{}</span>"#,
        attr(error_field),
        text(&messages.join(", "))
    )
}
