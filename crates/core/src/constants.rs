//! Constants used throughout the form entry core crate.

/// Namespace recorded on facts that carry a control path.
pub const DEFAULT_FORM_NAMESPACE: &str = "HtmlFormEntry";

/// Root element every template must use.
pub const ROOT_TAG: &str = "htmlform";

/// CSS class of the element that replaces the root tag in rendered output.
pub const ROOT_CSS_CLASS: &str = "htmlform";

/// Prefix of generated widget field names (`w1`, `w2`, ...).
pub const FIELD_NAME_PREFIX: &str = "w";

/// Elements that never have children and always render self-closed.
pub const VOID_ELEMENTS: &[&str] = &["br", "hr"];

/// Void reason used when nothing else is configured.
pub const DEFAULT_VOID_REASON: &str = "voided via form entry";

/// Void reason recorded on an encounter left without any active data.
pub const EMPTY_ENCOUNTER_VOID_REASON: &str = "encounter has no remaining data";

/// Upper bound for a dynamic repeat when the template does not declare `max`.
pub const DEFAULT_REPEAT_MAX: usize = 50;

/// Deepest nesting of expressions accepted by the expression parsers.
pub const MAX_EXPRESSION_DEPTH: usize = 64;
