//! Session-scoped registry of widgets and the reconciliation state behind them.
//!
//! One [`FormContext`] is built per render or submit cycle. It assigns every widget a generated
//! field name, pairs it with its error placeholder, remembers which control ids the template
//! declares, and owns the [`Reconciler`] that seeds widgets from stored facts.

use crate::constants::FIELD_NAME_PREFIX;
use crate::reconcile::Reconciler;
use crate::widget::Widget;
use crate::{FormError, FormResult};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

/// What the session is doing with the form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// A new encounter; defaults apply and nothing is reconciled.
    Enter,
    /// An existing encounter, editable.
    Edit,
    /// An existing encounter, read-only.
    View,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "ENTER",
            Self::Edit => "EDIT",
            Self::View => "VIEW",
        }
    }

    /// Whether the form shows data that was stored earlier.
    pub fn shows_existing_data(self) -> bool {
        !matches!(self, Self::Enter)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTER" => Ok(Self::Enter),
            "EDIT" => Ok(Self::Edit),
            "VIEW" => Ok(Self::View),
            other => Err(FormError::InvalidInput(format!("unknown form mode '{other}'"))),
        }
    }
}

/// A widget together with the names it was registered under.
#[derive(Debug, Clone)]
pub struct RegisteredWidget {
    pub field_name: String,
    pub widget: Widget,
    pub error_field: Option<String>,
}

#[derive(Debug)]
pub struct FormContext {
    mode: Mode,
    sequence: usize,
    widgets: Vec<RegisteredWidget>,
    by_name: HashMap<String, usize>,
    error_fields: HashMap<String, String>,
    control_ids: BTreeSet<String>,
    reconciler: Reconciler,
}

impl FormContext {
    pub fn new(mode: Mode, reconciler: Reconciler) -> Self {
        Self {
            mode,
            sequence: 0,
            widgets: Vec::new(),
            by_name: HashMap::new(),
            error_fields: HashMap::new(),
            control_ids: BTreeSet::new(),
            reconciler,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn next_name(&mut self) -> String {
        self.sequence += 1;
        format!("{FIELD_NAME_PREFIX}{}", self.sequence)
    }

    /// Registers `widget` under a freshly generated field name and returns that name.
    pub fn register_widget(&mut self, widget: Widget) -> String {
        let field_name = self.next_name();
        tracing::trace!("registered widget {field_name} ({:?})", widget.capability());
        self.insert(field_name.clone(), widget);
        field_name
    }

    /// Registers `widget` under a caller-chosen stable name.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidInput` if the name is already taken.
    pub fn register_named_widget(&mut self, field_name: impl Into<String>, widget: Widget) -> FormResult<String> {
        let field_name = field_name.into();
        if self.by_name.contains_key(&field_name) {
            return Err(FormError::InvalidInput(format!(
                "field name '{field_name}' is registered twice"
            )));
        }
        tracing::trace!("registered widget {field_name} ({:?})", widget.capability());
        self.insert(field_name.clone(), widget);
        Ok(field_name)
    }

    fn insert(&mut self, field_name: String, widget: Widget) {
        self.by_name.insert(field_name.clone(), self.widgets.len());
        self.widgets.push(RegisteredWidget {
            field_name,
            widget,
            error_field: None,
        });
    }

    /// Generates the error placeholder name for an already registered widget.
    ///
    /// # Errors
    ///
    /// Returns `FormError::UnknownField` if `field_name` was never registered.
    pub fn register_error_widget(&mut self, field_name: &str) -> FormResult<String> {
        let index = *self
            .by_name
            .get(field_name)
            .ok_or_else(|| FormError::UnknownField(field_name.to_owned()))?;
        let error_field = self.next_name();
        self.widgets[index].error_field = Some(error_field.clone());
        self.error_fields.insert(field_name.to_owned(), error_field.clone());
        Ok(error_field)
    }

    pub fn widget(&self, field_name: &str) -> Option<&Widget> {
        self.by_name.get(field_name).map(|&i| &self.widgets[i].widget)
    }

    pub fn error_field_for(&self, field_name: &str) -> Option<&str> {
        self.error_fields.get(field_name).map(String::as_str)
    }

    /// Every widget in registration order.
    pub fn widgets(&self) -> &[RegisteredWidget] {
        &self.widgets
    }

    /// Records a control id declared by the template.
    ///
    /// # Errors
    ///
    /// Returns `FormError::DuplicateControlId` the second time the same id is declared.
    pub fn declare_control_id(&mut self, control_id: &str) -> FormResult<()> {
        if !self.control_ids.insert(control_id.to_owned()) {
            return Err(FormError::DuplicateControlId(control_id.to_owned()));
        }
        Ok(())
    }

    pub fn control_ids(&self) -> &BTreeSet<String> {
        &self.control_ids
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Reconciler {
        &mut self.reconciler
    }

    /// Whether any stored fact was assigned without a unique discriminator.
    pub fn is_guessing(&self) -> bool {
        self.reconciler.is_guessing()
    }
}
