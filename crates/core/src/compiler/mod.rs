//! The tag processor.
//!
//! Walks a fully resolved template tree (conditionals gone, repeats unrolled) and produces the
//! rendered markup, the form schema and the list of compiled elements. Every clinical tag becomes
//! a widget registered in the [`FormContext`], a schema field attached to the currently open
//! section or group, and a [`FormElement`] remembering the stored fact it was reconciled with.
//!
//! Group nesting is tracked twice, in lockstep: the [`SchemaBuilder`] stack and the
//! reconciler's scope stack. Both are pushed when an `<obsgroup>` opens and popped when it closes.

mod tags;

pub(crate) use tags::declared_control_ids;

use crate::config::CoreConfig;
use crate::constants::{ROOT_CSS_CLASS, ROOT_TAG, VOID_ELEMENTS};
use crate::context::{FormContext, Mode};
use crate::default_value::{DateShape, DefaultValueSource, DefaultValueSources};
use crate::element::FormElement;
use crate::error::FieldError;
use crate::fact::{Encounter, ProgramEnrollment};
use crate::metadata::{Concept, MetadataResolver};
use crate::reconcile::{GroupComponent, GroupSlot};
use crate::schema::{FormSchema, SchemaBuilder};
use crate::subject::Subject;
use crate::submission::Submission;
use crate::template::repeat::{DYNAMIC_REPEAT, REPEAT_INSTANCE};
use crate::template::{Element, TemplateNode};
use crate::widget::{render_error_placeholder, Widget, WidgetKind, WidgetValue};
use crate::{FormError, FormResult};
use chrono::{NaiveDate, NaiveDateTime};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use std::collections::BTreeMap;
use std::fmt::Write;

pub const SECTION: &str = "section";
pub const OBS: &str = "obs";
pub const OBS_GROUP: &str = "obsgroup";
pub const OBS_HISTORY: &str = "obsHistory";
pub const ENCOUNTER_DATE: &str = "encounterDate";
pub const ENCOUNTER_LOCATION: &str = "encounterLocation";
pub const ENCOUNTER_PROVIDER: &str = "encounterProvider";
pub const ENROLL_IN_PROGRAM: &str = "enrollInProgram";
pub const WORKFLOW_STATE: &str = "workflowState";
pub const ORDER: &str = "order";

/// Everything the compiler reads besides the template.
#[derive(Clone, Copy)]
pub struct CompileInput<'a> {
    pub config: &'a CoreConfig,
    pub resolver: &'a dyn MetadataResolver,
    pub subject: &'a Subject,
    pub encounter: Option<&'a Encounter>,
    pub enrollments: &'a [ProgramEnrollment],
    /// A failed submission being redisplayed.
    pub submission: Option<&'a Submission>,
    pub errors: &'a [FieldError],
    pub session_attributes: &'a BTreeMap<String, String>,
    pub now: NaiveDateTime,
}

/// Output of one compilation.
#[derive(Debug, Clone)]
pub struct CompiledForm {
    pub html: String,
    pub schema: FormSchema,
    pub elements: Vec<FormElement>,
}

/// Compiles a resolved template rooted at `<htmlform>`.
///
/// # Errors
///
/// Returns the first structural error found: a missing or invalid attribute, an unresolvable
/// metadata reference, an invalid default value or an ambiguous control id.
pub fn compile(root: &Element, input: CompileInput<'_>, context: &mut FormContext) -> FormResult<CompiledForm> {
    let mut compiler = Compiler {
        input,
        context,
        schema: SchemaBuilder::new(input.config.form_name()),
        elements: Vec::new(),
        out: String::new(),
    };
    compiler.element(root)?;
    tracing::debug!(
        "compiled form '{}' with {} widgets and {} elements",
        input.config.form_name(),
        compiler.context.widgets().len(),
        compiler.elements.len()
    );
    Ok(CompiledForm {
        html: compiler.out,
        schema: compiler.schema.finish(),
        elements: compiler.elements,
    })
}

struct Compiler<'a, 'c> {
    input: CompileInput<'a>,
    context: &'c mut FormContext,
    schema: SchemaBuilder,
    elements: Vec<FormElement>,
    out: String,
}

impl Compiler<'_, '_> {
    fn mode(&self) -> Mode {
        self.context.mode()
    }

    fn children(&mut self, element: &Element) -> FormResult<()> {
        for child in &element.children {
            match child {
                TemplateNode::Element(e) => self.element(e)?,
                TemplateNode::Text(t) => self.out.push_str(&text(t)),
            }
        }
        Ok(())
    }

    fn element(&mut self, element: &Element) -> FormResult<()> {
        match element.name.as_str() {
            ROOT_TAG => self.root(element),
            SECTION => self.section(element),
            DYNAMIC_REPEAT => self.dynamic_repeat(element),
            OBS_GROUP => self.obs_group(element),
            OBS => self.obs(element),
            OBS_HISTORY => self.obs_history(element),
            ENCOUNTER_DATE => self.encounter_date(element),
            ENCOUNTER_LOCATION => self.encounter_location(element),
            ENCOUNTER_PROVIDER => self.encounter_provider(element),
            ENROLL_IN_PROGRAM => self.enroll_in_program(element),
            WORKFLOW_STATE => self.workflow_state(element),
            ORDER => self.order(element),
            _ => self.passthrough(element),
        }
    }

    fn root(&mut self, element: &Element) -> FormResult<()> {
        let slots = self.group_slots(element)?;
        self.context.reconciler_mut().plan_groups(&slots);
        let _ = write!(self.out, r#"<div class="{ROOT_CSS_CLASS}">"#);
        self.children(element)?;
        self.out.push_str("</div>");
        Ok(())
    }

    fn section(&mut self, element: &Element) -> FormResult<()> {
        let label = element.non_empty_attribute("headerLabel").map(str::to_owned);
        self.schema.begin_section(label.clone());
        self.out.push_str(r#"<div class="section">"#);
        if let Some(label) = &label {
            let _ = write!(self.out, r#"<span class="sectionHeader">{}</span>"#, text(label));
        }
        self.children(element)?;
        self.out.push_str("</div>");
        self.schema.end_section();
        Ok(())
    }

    fn dynamic_repeat(&mut self, element: &Element) -> FormResult<()> {
        let id = element.required_attribute("id")?.to_owned();
        let count = element.required_attribute("count")?.to_owned();
        let mut counter = Widget::new(WidgetKind::Hidden);
        counter.set_initial_value(Some(WidgetValue::Text(count)));
        let count_field = self
            .context
            .register_named_widget(format!("repeat-{id}-count"), counter)?;

        self.schema.begin_repeat(id.clone());
        let _ = write!(self.out, r#"<div class="repeat" id="repeat-{}">"#, attr(&id));
        self.widget_markup(&count_field);
        for instance in element.child_elements().filter(|c| c.name == REPEAT_INSTANCE) {
            let index = instance.attribute("index").unwrap_or("0");
            let copy = index != "0";
            if copy {
                self.schema.suppress();
            }
            let _ = write!(self.out, r#"<div class="repeat-instance" data-index="{}">"#, attr(index));
            self.children(instance)?;
            self.out.push_str("</div>");
            if copy {
                self.schema.resume();
            }
        }
        self.out.push_str("</div>");
        self.schema.end_repeat();
        Ok(())
    }

    fn obs_group(&mut self, element: &Element) -> FormResult<()> {
        let concept = self.concept(element, "groupingConceptId")?;
        let label = element.non_empty_attribute("label").map(str::to_owned);
        let existing = self.context.reconciler_mut().enter_group();
        let slots = self.group_slots(element)?;
        self.context.reconciler_mut().plan_groups(&slots);

        self.schema.begin_group(concept.id, label.clone());
        self.elements
            .push(FormElement::GroupStart(crate::element::GroupElement {
                concept: concept.id,
                existing,
            }));
        self.out.push_str(r#"<div class="obsgroup">"#);
        if let Some(label) = &label {
            let _ = write!(self.out, r#"<span class="obsgroup-label">{}</span>"#, text(label));
        }
        self.children(element)?;
        self.out.push_str("</div>");
        self.elements.push(FormElement::GroupEnd);
        self.schema.end_group();
        self.context.reconciler_mut().exit_group();
        Ok(())
    }

    /// Markup for any tag the compiler does not interpret.
    fn passthrough(&mut self, element: &Element) -> FormResult<()> {
        let _ = write!(self.out, "<{}", element.name);
        for (name, value) in &element.attributes {
            let _ = write!(self.out, r#" {name}="{}""#, attr(value));
        }
        let is_void = VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(&element.name));
        if is_void || element.children.is_empty() {
            self.out.push_str("/>");
            return Ok(());
        }
        self.out.push('>');
        self.children(element)?;
        let _ = write!(self.out, "</{}>", element.name);
        Ok(())
    }

    /// The group slots directly below `scope`, in document order, for reconciliation planning.
    fn group_slots(&self, scope: &Element) -> FormResult<Vec<GroupSlot>> {
        let mut slots = Vec::new();
        for child in scope.child_elements() {
            if child.name == OBS_GROUP {
                slots.push(GroupSlot {
                    concept: self.concept(child, "groupingConceptId")?.id,
                    components: self.group_components(child)?,
                });
            } else {
                slots.extend(self.group_slots(child)?);
            }
        }
        Ok(slots)
    }

    /// Questions asked by the obs tags whose nearest enclosing group is `group`, plus the grouping
    /// concept of every group nested below it.
    fn group_components(&self, group: &Element) -> FormResult<Vec<GroupComponent>> {
        fn walk(compiler: &Compiler<'_, '_>, element: &Element, nested: bool, out: &mut Vec<GroupComponent>) -> FormResult<()> {
            for child in element.child_elements() {
                match child.name.as_str() {
                    OBS if !nested => {
                        let question = compiler.concept(child, "conceptId")?.id;
                        if let Some(answer) = child.non_empty_attribute("answerConceptId") {
                            let answer = compiler.concept_reference(child, answer)?.id;
                            out.push(GroupComponent::new(question, Some(answer)));
                        } else {
                            let answers: Vec<_> = compiler
                                .concept_list(child, "answerConceptIds")?
                                .into_iter()
                                .map(|c| c.id)
                                .collect();
                            if answers.is_empty() {
                                out.push(GroupComponent::new(question, None));
                            } else {
                                out.extend(GroupComponent::answer_set(question, &answers));
                            }
                        }
                    }
                    OBS_GROUP => {
                        let concept = compiler.concept(child, "groupingConceptId")?.id;
                        out.push(GroupComponent::new(concept, None));
                        walk(compiler, child, true, out)?;
                    }
                    _ => walk(compiler, child, nested, out)?,
                }
            }
            Ok(())
        }

        let mut components = Vec::new();
        walk(self, group, false, &mut components)?;
        Ok(components)
    }

    fn concept(&self, element: &Element, attribute: &str) -> FormResult<Concept> {
        let reference = element.required_attribute(attribute)?;
        self.concept_reference(element, reference)
    }

    fn concept_reference(&self, element: &Element, reference: &str) -> FormResult<Concept> {
        self.input
            .resolver
            .concept(reference)
            .ok_or_else(|| FormError::UnknownConcept {
                tag: element.name.clone(),
                reference: reference.to_owned(),
            })
    }

    /// Concepts of a comma-separated attribute; empty when the attribute is absent.
    fn concept_list(&self, element: &Element, attribute: &str) -> FormResult<Vec<Concept>> {
        split_list(element.attribute(attribute))
            .into_iter()
            .map(|reference| self.concept_reference(element, reference))
            .collect()
    }

    /// Registers a widget and, outside VIEW mode, its error placeholder.
    fn register(&mut self, widget: Widget) -> FormResult<String> {
        let field_name = self.context.register_widget(widget);
        if self.mode() != Mode::View {
            self.context.register_error_widget(&field_name)?;
        }
        Ok(field_name)
    }

    /// Seeds `widget` from a default-value attribute. Only new forms use defaults.
    ///
    /// `lookup` turns the resolved text into the option value the widget expects, for pickers
    /// whose defaults name metadata.
    fn apply_default(
        &self,
        element: &Element,
        attribute: &str,
        widget: &mut Widget,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> FormResult<()> {
        if self.mode() != Mode::Enter {
            return Ok(());
        }
        let Some(source_text) = element.non_empty_attribute(attribute) else {
            return Ok(());
        };
        let source = DefaultValueSource::parse(source_text);
        let shape = match widget.kind() {
            WidgetKind::Datetime { .. } => DateShape::Datetime,
            _ => DateShape::Date,
        };
        let sources = DefaultValueSources {
            now: self.input.now,
            session: self.input.session_attributes,
            config: self.input.config,
        };
        let Some(resolved) = sources.resolve(&source, shape) else {
            return Ok(());
        };
        let invalid = |reason: String| FormError::InvalidDefaultValue {
            tag: element.name.clone(),
            value: resolved.clone(),
            reason,
        };
        let option = lookup(&resolved).ok_or_else(|| invalid("no such item".to_owned()))?;
        let value = widget.parse(Some(&option), self.input.now).map_err(invalid)?;
        widget.set_initial_value(value);
        Ok(())
    }

    /// Appends a widget's control and its error placeholder.
    fn widget_markup(&mut self, field_name: &str) {
        let submitted = self
            .input
            .submission
            .map(|s| s.get(field_name).map_or("", String::as_str));
        if let Some(widget) = self.context.widget(field_name) {
            self.out.push_str(&widget.render(field_name, self.context.mode(), submitted));
        }
        if let Some(error_field) = self.context.error_field_for(field_name) {
            let messages: Vec<&str> = self
                .input
                .errors
                .iter()
                .filter(|e| e.field_name == field_name)
                .map(|e| e.message.as_str())
                .collect();
            self.out.push_str(&render_error_placeholder(error_field, &messages));
        }
    }

    fn label_markup(&mut self, field_name: &str, label: Option<&str>) {
        if let Some(label) = label {
            let _ = write!(self.out, r#"<label for="{}">{}</label> "#, attr(field_name), text(label));
        }
    }

    /// The date the stored encounter happened on, or today for a new one.
    fn current_encounter_date(&self) -> NaiveDate {
        self.input
            .encounter
            .map_or(self.input.now.date(), |e| e.encounter_datetime.date())
    }
}

/// Items of a comma-separated attribute value, trimmed, empty items dropped.
fn split_list(value: Option<&str>) -> Vec<&str> {
    value
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}
