//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into form sessions. Sessions never read process-wide environment variables, so the
//! same template renders identically in tests, the CLI and any hosting service.

use crate::constants::{DEFAULT_FORM_NAMESPACE, DEFAULT_VOID_REASON};
use crate::{FormError, FormResult};
use formentry_types::NonEmptyText;
use std::collections::BTreeMap;

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    form_name: String,
    form_version: String,
    form_namespace: NonEmptyText,
    global_properties: BTreeMap<String, String>,
    void_reason: NonEmptyText,
}

/// On-disk shape of [`CoreConfig`]; validated by [`CoreConfig::from_yaml_str`].
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
struct RawConfig {
    form_name: String,
    form_version: String,
    #[serde(default)]
    form_namespace: Option<String>,
    #[serde(default)]
    global_properties: BTreeMap<String, String>,
    #[serde(default)]
    void_reason: Option<String>,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` if the form name or version is empty or contains
    /// characters that would break the control path (`<name>.<version>/<control>-<n>`).
    pub fn new(form_name: String, form_version: String) -> FormResult<Self> {
        validate_path_segment("form_name", &form_name)?;
        validate_path_segment("form_version", &form_version)?;

        Ok(Self {
            form_name,
            form_version,
            form_namespace: non_empty("form_namespace", DEFAULT_FORM_NAMESPACE)?,
            global_properties: BTreeMap::new(),
            void_reason: non_empty("void_reason", DEFAULT_VOID_REASON)?,
        })
    }

    /// Load configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` if the YAML does not parse or any value is invalid.
    pub fn from_yaml_str(yaml: &str) -> FormResult<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FormError::InvalidInput(format!("invalid configuration: {e}")))?;

        let mut config = Self::new(raw.form_name, raw.form_version)?;
        if let Some(namespace) = raw.form_namespace {
            config = config.with_form_namespace(namespace)?;
        }
        if let Some(reason) = raw.void_reason {
            config = config.with_void_reason(reason)?;
        }
        config.global_properties = raw.global_properties;
        Ok(config)
    }

    pub fn with_form_namespace(mut self, namespace: String) -> FormResult<Self> {
        self.form_namespace = non_empty("form_namespace", &namespace)?;
        Ok(self)
    }

    pub fn with_void_reason(mut self, reason: String) -> FormResult<Self> {
        self.void_reason = non_empty("void_reason", &reason)?;
        Ok(self)
    }

    pub fn with_global_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_properties.insert(name.into(), value.into());
        self
    }

    pub fn form_name(&self) -> &str {
        &self.form_name
    }

    pub fn form_version(&self) -> &str {
        &self.form_version
    }

    pub fn form_namespace(&self) -> &str {
        self.form_namespace.as_str()
    }

    pub fn void_reason(&self) -> &str {
        self.void_reason.as_str()
    }

    pub fn global_property(&self, name: &str) -> Option<&str> {
        self.global_properties.get(name).map(String::as_str)
    }
}

fn non_empty(field: &str, value: &str) -> FormResult<NonEmptyText> {
    NonEmptyText::new(value).map_err(|e| FormError::InvalidInput(format!("{field}: {e}")))
}

/// Validates that a value can be embedded in a control path.
///
/// Only a conservative ASCII set is accepted, so the `/` and `-` separators of the path stay
/// unambiguous.
fn validate_path_segment(field: &str, value: &str) -> FormResult<()> {
    const MAX_SEGMENT_LEN: usize = 128;

    if value.trim().is_empty() {
        return Err(FormError::InvalidInput(format!("{field} cannot be empty")));
    }

    if value.len() > MAX_SEGMENT_LEN {
        return Err(FormError::InvalidInput(format!(
            "{field} exceeds maximum length of {MAX_SEGMENT_LEN} characters"
        )));
    }

    let ok = value
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'_' | b' '));

    if !ok {
        return Err(FormError::InvalidInput(format!(
            "{field} contains invalid characters (only alphanumeric, '.', '_' and spaces allowed)"
        )));
    }

    Ok(())
}
