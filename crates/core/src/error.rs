/// Failures reported by the storage collaborator.
///
/// The engine never retries; these are surfaced to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Errors that abort form compilation or submission.
///
/// Structural template errors name the offending tag so that the template author can find it.
/// Field-level validation problems are not represented here; see [`FieldError`].
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("malformed template: {0}")]
    MalformedTemplate(String),
    #[error("<{tag}> is missing required attribute '{attribute}'")]
    MissingAttribute { tag: String, attribute: String },
    #[error("<{tag}> has invalid value '{value}' for attribute '{attribute}'")]
    InvalidAttribute {
        tag: String,
        attribute: String,
        value: String,
    },
    #[error("<{tag}> references unknown concept '{reference}'")]
    UnknownConcept { tag: String, reference: String },
    #[error("<{tag}> references unknown location '{reference}'")]
    UnknownLocation { tag: String, reference: String },
    #[error("<{tag}> references unknown person '{reference}'")]
    UnknownPerson { tag: String, reference: String },
    #[error("<{tag}> references unknown program '{reference}'")]
    UnknownProgram { tag: String, reference: String },
    #[error("<{tag}> references unknown workflow or state '{reference}'")]
    UnknownWorkflowState { tag: String, reference: String },
    #[error("invalid {dialect} expression '{expression}': {reason}")]
    InvalidExpression {
        dialect: &'static str,
        expression: String,
        reason: String,
    },
    #[error("<{tag}> has an invalid default value '{value}': {reason}")]
    InvalidDefaultValue {
        tag: String,
        value: String,
        reason: String,
    },
    #[error("control id '{0}' is declared more than once in the template")]
    DuplicateControlId(String),
    #[error("multiple active facts are matching the control id '{0}'")]
    AmbiguousControlId(String),
    #[error("field '{0}' is not registered in this form")]
    UnknownField(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type FormResult<T> = std::result::Result<T, FormError>;

impl FormError {
    pub(crate) fn missing(tag: &str, attribute: &str) -> Self {
        Self::MissingAttribute {
            tag: tag.to_owned(),
            attribute: attribute.to_owned(),
        }
    }

    pub(crate) fn invalid(tag: &str, attribute: &str, value: &str) -> Self {
        Self::InvalidAttribute {
            tag: tag.to_owned(),
            attribute: attribute.to_owned(),
            value: value.to_owned(),
        }
    }
}

/// A validation failure for one rendered control.
///
/// Keyed by the generated field name of the widget that failed, so a caller can attach the
/// message to the matching error placeholder.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field_name: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field_name, self.message)
    }
}
