//! Clinical leaf tags.

use super::{split_list, Compiler, OBS};
use crate::element::{EnrollmentElement, FormElement, ObsElement, OrderElement, ReferenceElement, WorkflowStateElement};
use crate::fact::FactValue;
use crate::metadata::{Concept, ConceptDatatype, MetadataRef};
use crate::reconcile::AnswerFilter;
use crate::schema::{FieldKind, SchemaField};
use crate::widget::{OptionKind, SelectOption, SelectStyle, Widget, WidgetKind, WidgetValue};
use crate::template::Element;
use crate::{FormError, FormResult};
use html_escape::encode_text as text;
use std::fmt::Write;
use std::str::FromStr;

fn number_attribute<T: FromStr>(element: &Element, name: &str) -> FormResult<Option<T>> {
    element
        .non_empty_attribute(name)
        .map(|v| v.trim().parse::<T>().map_err(|_| FormError::invalid(&element.name, name, v)))
        .transpose()
}

fn select_style(element: &Element) -> FormResult<SelectStyle> {
    match element.non_empty_attribute("style") {
        None | Some("dropdown") => Ok(SelectStyle::Dropdown),
        Some("radio") => Ok(SelectStyle::Radio),
        Some(other) => Err(FormError::invalid(&element.name, "style", other)),
    }
}

fn yes_no() -> Vec<SelectOption> {
    vec![SelectOption::new("true", "Yes"), SelectOption::new("false", "No")]
}

impl Compiler<'_, '_> {
    /// Chooses the widget for an `<obs>` tag and the answer filter reconciliation applies.
    fn obs_widget(&self, element: &Element, concept: &Concept) -> FormResult<(WidgetKind, AnswerFilter, Vec<Concept>)> {
        let style = element.non_empty_attribute("style");
        let allow_future = element.bool_attribute("allowFutureDates", false)?;

        if let Some(reference) = element.non_empty_attribute("answerConceptId") {
            let answer = self.concept_reference(element, reference)?;
            let label = element
                .non_empty_attribute("answerLabel")
                .unwrap_or(answer.name.as_str())
                .to_owned();
            let kind = WidgetKind::Checkbox {
                value: WidgetValue::Coded(answer.id),
                label,
            };
            return Ok((kind, AnswerFilter::Exactly(answer.id), vec![answer]));
        }

        let kind = match &concept.datatype {
            ConceptDatatype::Numeric { low, high, precise } => WidgetKind::Number {
                min: *low,
                max: *high,
                decimals: *precise,
            },
            ConceptDatatype::Text => WidgetKind::Text {
                rows: match style {
                    Some("textarea") => Some(number_attribute(element, "rows")?.unwrap_or(2)),
                    _ => None,
                },
                cols: number_attribute(element, "cols")?,
            },
            ConceptDatatype::Date => WidgetKind::Date { allow_future },
            ConceptDatatype::Datetime => WidgetKind::Datetime { allow_future },
            ConceptDatatype::Boolean if style == Some("checkbox") => WidgetKind::Checkbox {
                value: WidgetValue::Boolean(true),
                label: element.non_empty_attribute("answerLabel").unwrap_or("").to_owned(),
            },
            ConceptDatatype::Boolean => WidgetKind::Select {
                options: yes_no(),
                style: select_style(element)?,
                kind: OptionKind::Boolean,
            },
            ConceptDatatype::Coded => {
                let declared = self.concept_list(element, "answerConceptIds")?;
                if !declared.is_empty() {
                    let labels = split_list(element.attribute("answerLabels"));
                    let options = declared
                        .iter()
                        .enumerate()
                        .map(|(i, c)| SelectOption::new(c.id.to_string(), labels.get(i).copied().unwrap_or(c.name.as_str())))
                        .collect();
                    let filter = AnswerFilter::OneOf(declared.iter().map(|c| c.id).collect());
                    let kind = WidgetKind::Select {
                        options,
                        style: select_style(element)?,
                        kind: OptionKind::Concept,
                    };
                    return Ok((kind, filter, declared));
                }
                let options = concept
                    .answers
                    .iter()
                    .map(|id| {
                        self.input
                            .resolver
                            .concept_by_id(*id)
                            .map(|c| SelectOption::new(c.id.to_string(), c.name))
                            .ok_or_else(|| FormError::UnknownConcept {
                                tag: element.name.clone(),
                                reference: id.to_string(),
                            })
                    })
                    .collect::<FormResult<Vec<_>>>()?;
                WidgetKind::Select {
                    options,
                    style: select_style(element)?,
                    kind: OptionKind::Concept,
                }
            }
            ConceptDatatype::NotApplicable => {
                return Err(FormError::invalid(
                    &element.name,
                    "conceptId",
                    element.attribute("conceptId").unwrap_or_default(),
                ))
            }
        };
        let filter = match &kind {
            WidgetKind::Checkbox { value: WidgetValue::Boolean(checked), .. } => AnswerFilter::Boolean(*checked),
            _ => AnswerFilter::Any,
        };
        Ok((kind, filter, Vec::new()))
    }

    pub(super) fn obs(&mut self, element: &Element) -> FormResult<()> {
        let concept = self.concept(element, "conceptId")?;
        let (kind, filter, answers) = self.obs_widget(element, &concept)?;
        let required = element.bool_attribute("required", false)?;
        let control_id = element.non_empty_attribute("controlId").map(str::to_owned);
        let label = element.non_empty_attribute("labelText").map(str::to_owned);

        let existing = if self.mode().shows_existing_data() {
            let reconciler = self.context.reconciler_mut();
            match &control_id {
                Some(control_id) => reconciler.take_by_control_id(control_id, concept.id, &filter)?,
                None => reconciler.take_obs(concept.id, &filter),
            }
        } else {
            None
        };

        let mut widget = Widget::new(kind);
        let initial = existing
            .as_ref()
            .and_then(|o| o.value.clone())
            .map(WidgetValue::from)
            .filter(|value| match widget.kind() {
                WidgetKind::Checkbox { value: checked, .. } => value == checked,
                _ => true,
            });
        widget.set_initial_value(initial);
        self.apply_default(element, "defaultValue", &mut widget, |raw| Some(raw.to_owned()))?;
        let field_name = self.register(widget)?;

        self.schema.add_field(SchemaField {
            concept: Some(concept.id),
            answers: answers.iter().map(|c| c.id).collect(),
            control_id: control_id.clone(),
            label: label.clone(),
            ..SchemaField::new(FieldKind::Obs)
        });
        self.elements.push(FormElement::Obs(ObsElement {
            field_name: field_name.clone(),
            concept: concept.id,
            required,
            control_id,
            existing,
        }));

        self.label_markup(&field_name, label.as_deref());
        self.widget_markup(&field_name);
        Ok(())
    }

    /// Lists a controlled observation and every version it superseded.
    pub(super) fn obs_history(&mut self, element: &Element) -> FormResult<()> {
        let control_id = element.required_attribute("controlId")?;
        let Some(encounter) = self.input.encounter.filter(|_| self.mode().shows_existing_data()) else {
            return Ok(());
        };
        let current = encounter.active_obs_by_control_id(control_id);
        if current.len() > 1 {
            return Err(FormError::AmbiguousControlId(control_id.to_owned()));
        }
        let Some(head) = current.first() else {
            return Ok(());
        };

        self.out.push_str(r#"<div class="obs-history">"#);
        if let Some(label) = element.non_empty_attribute("labelText") {
            let _ = write!(self.out, r#"<span class="label">{}</span>"#, text(label));
        }
        for obs in encounter.revision_chain(head.id) {
            let class = if obs.is_voided() { "obs-history-entry voided" } else { "obs-history-entry" };
            let value = obs.value.as_ref().map(|v| self.display_value(v)).unwrap_or_default();
            let _ = write!(
                self.out,
                r#"<div class="{class}"><span class="value">{}</span> <span class="date">{}</span></div>"#,
                text(&value),
                obs.obs_datetime.format("%Y-%m-%d %H:%M")
            );
        }
        self.out.push_str("</div>");
        Ok(())
    }

    fn display_value(&self, value: &FactValue) -> String {
        match value {
            FactValue::Coded(id) => self
                .input
                .resolver
                .concept_by_id(*id)
                .map_or_else(|| id.to_string(), |c| c.name),
            FactValue::Boolean(true) => "Yes".to_owned(),
            FactValue::Boolean(false) => "No".to_owned(),
            FactValue::Date(date) => date.format("%Y-%m-%d").to_string(),
            other => WidgetValue::from(other.clone()).to_raw(),
        }
    }

    pub(super) fn encounter_date(&mut self, element: &Element) -> FormResult<()> {
        let allow_future = element.bool_attribute("allowFutureDates", false)?;
        let mut widget = Widget::new(WidgetKind::Date { allow_future });
        if let Some(encounter) = self.input.encounter.filter(|_| self.mode().shows_existing_data()) {
            widget.set_initial_value(Some(WidgetValue::Date(encounter.encounter_datetime.date())));
        }
        self.apply_default(element, "default", &mut widget, |raw| Some(raw.to_owned()))?;
        let field_name = self.register(widget)?;

        self.schema.add_field(SchemaField::new(FieldKind::EncounterDate));
        self.elements.push(FormElement::EncounterDate {
            field_name: field_name.clone(),
        });
        let label = element.non_empty_attribute("labelText");
        self.label_markup(&field_name, label);
        self.widget_markup(&field_name);
        Ok(())
    }

    pub(super) fn encounter_location(&mut self, element: &Element) -> FormResult<()> {
        let resolver = self.input.resolver;
        let references = split_list(element.attribute("locations"));
        let locations = if references.is_empty() {
            resolver.all_locations()
        } else {
            references
                .into_iter()
                .map(|r| {
                    resolver.location(r).ok_or_else(|| FormError::UnknownLocation {
                        tag: element.name.clone(),
                        reference: r.to_owned(),
                    })
                })
                .collect::<FormResult<Vec<_>>>()?
        };
        let options = locations
            .iter()
            .map(|l| SelectOption::new(l.id.to_string(), l.name.clone()))
            .collect();
        let mut widget = Widget::new(WidgetKind::Select {
            options,
            style: SelectStyle::Dropdown,
            kind: OptionKind::Reference,
        });
        if self.mode().shows_existing_data() {
            let current = self.input.encounter.and_then(|e| e.location);
            widget.set_initial_value(current.map(|l| WidgetValue::Reference(l.get())));
        }
        self.apply_default(element, "default", &mut widget, |raw| {
            resolver.location(raw).map(|l| l.id.to_string())
        })?;
        self.reference_field(element, widget, FieldKind::EncounterLocation)
    }

    pub(super) fn encounter_provider(&mut self, element: &Element) -> FormResult<()> {
        let resolver = self.input.resolver;
        let references = split_list(element.attribute("persons"));
        let people = if references.is_empty() {
            resolver.all_providers()
        } else {
            references
                .into_iter()
                .map(|r| {
                    resolver.person(r).ok_or_else(|| FormError::UnknownPerson {
                        tag: element.name.clone(),
                        reference: r.to_owned(),
                    })
                })
                .collect::<FormResult<Vec<_>>>()?
        };
        let options = people
            .iter()
            .map(|p| SelectOption::new(p.id.to_string(), p.name.clone()))
            .collect();
        let mut widget = Widget::new(WidgetKind::Select {
            options,
            style: SelectStyle::Dropdown,
            kind: OptionKind::Reference,
        });
        if self.mode().shows_existing_data() {
            let current = self.input.encounter.and_then(|e| e.provider);
            widget.set_initial_value(current.map(|p| WidgetValue::Reference(p.get())));
        }
        self.apply_default(element, "default", &mut widget, |raw| {
            resolver.person(raw).map(|p| p.id.to_string())
        })?;
        self.reference_field(element, widget, FieldKind::EncounterProvider)
    }

    fn reference_field(&mut self, element: &Element, widget: Widget, kind: FieldKind) -> FormResult<()> {
        let required = element.bool_attribute("required", true)?;
        let field_name = self.register(widget)?;
        self.schema.add_field(SchemaField::new(kind));
        let reference = ReferenceElement {
            field_name: field_name.clone(),
            required,
        };
        self.elements.push(match kind {
            FieldKind::EncounterProvider => FormElement::EncounterProvider(reference),
            _ => FormElement::EncounterLocation(reference),
        });
        self.label_markup(&field_name, element.non_empty_attribute("labelText"));
        self.widget_markup(&field_name);
        Ok(())
    }

    pub(super) fn enroll_in_program(&mut self, element: &Element) -> FormResult<()> {
        let reference = element.required_attribute("programId")?;
        let program = self
            .input
            .resolver
            .program(reference)
            .ok_or_else(|| FormError::UnknownProgram {
                tag: element.name.clone(),
                reference: reference.to_owned(),
            })?;
        let show_date = element.bool_attribute("showDate", false)?;
        let date = self.current_encounter_date();
        let enrollments = self.input.enrollments;
        let enrollment = enrollments
            .iter()
            .find(|e| e.program == program.id && e.is_active_on(date));

        let label = element.non_empty_attribute("label").unwrap_or(program.name.as_str()).to_owned();
        let mut checkbox = Widget::new(WidgetKind::Checkbox {
            value: WidgetValue::Boolean(true),
            label,
        });
        if enrollment.is_some() && self.mode().shows_existing_data() {
            checkbox.set_initial_value(Some(WidgetValue::Boolean(true)));
        }
        let field_name = self.register(checkbox)?;
        self.widget_markup(&field_name);

        let date_field = if show_date {
            let mut widget = Widget::new(WidgetKind::Date { allow_future: false });
            if self.mode().shows_existing_data() {
                widget.set_initial_value(enrollment.map(|e| WidgetValue::Date(e.date_enrolled)));
            }
            let date_field = self.register(widget)?;
            self.out.push(' ');
            self.widget_markup(&date_field);
            Some(date_field)
        } else {
            None
        };

        self.schema.add_field(SchemaField {
            label: Some(program.name.clone()),
            ..SchemaField::new(FieldKind::ProgramEnrollment)
        });
        self.elements.push(FormElement::EnrollInProgram(EnrollmentElement {
            field_name,
            date_field,
            program: program.id,
            enrolled: enrollment.is_some(),
        }));
        Ok(())
    }

    pub(super) fn workflow_state(&mut self, element: &Element) -> FormResult<()> {
        let reference = element.required_attribute("workflowId")?;
        let unknown = |reference: &str| FormError::UnknownWorkflowState {
            tag: element.name.clone(),
            reference: reference.to_owned(),
        };
        let (program, workflow) = self
            .input
            .resolver
            .workflow(reference)
            .ok_or_else(|| unknown(reference))?;

        let wanted = split_list(element.attribute("stateIds"));
        let states = if wanted.is_empty() {
            workflow.states.clone()
        } else {
            wanted
                .into_iter()
                .map(|r| {
                    let parsed = MetadataRef::parse(r);
                    workflow
                        .states
                        .iter()
                        .find(|s| parsed.matches(s.id.get(), None, &s.name))
                        .cloned()
                        .ok_or_else(|| unknown(r))
                })
                .collect::<FormResult<Vec<_>>>()?
        };

        let date = self.current_encounter_date();
        let enrollments = self.input.enrollments;
        let current = enrollments
            .iter()
            .filter(|e| e.program == program.id && e.is_active_on(date))
            .find_map(|e| e.state_on(workflow.id, date))
            .map(|s| s.state);

        let options = states
            .iter()
            .map(|s| SelectOption::new(s.id.to_string(), s.name.clone()))
            .collect();
        let mut widget = Widget::new(WidgetKind::Select {
            options,
            style: select_style(element)?,
            kind: OptionKind::Reference,
        });
        if self.mode().shows_existing_data() {
            widget.set_initial_value(current.map(|s| WidgetValue::Reference(s.get())));
        }
        let field_name = self.register(widget)?;

        self.schema.add_field(SchemaField {
            label: Some(workflow.name.clone()),
            ..SchemaField::new(FieldKind::WorkflowState)
        });
        self.elements.push(FormElement::WorkflowState(WorkflowStateElement {
            field_name: field_name.clone(),
            program: program.id,
            workflow: workflow.id,
            current,
        }));
        self.label_markup(&field_name, element.non_empty_attribute("label"));
        self.widget_markup(&field_name);
        Ok(())
    }

    pub(super) fn order(&mut self, element: &Element) -> FormResult<()> {
        let concept = self.concept(element, "conceptId")?;
        let existing = if self.mode().shows_existing_data() {
            self.context.reconciler_mut().take_order(concept.id)
        } else {
            None
        };
        let label = element.non_empty_attribute("label").unwrap_or(concept.name.as_str()).to_owned();
        let mut widget = Widget::new(WidgetKind::Checkbox {
            value: WidgetValue::Boolean(true),
            label,
        });
        if existing.is_some() {
            widget.set_initial_value(Some(WidgetValue::Boolean(true)));
        }
        let field_name = self.register(widget)?;

        self.schema.add_field(SchemaField {
            concept: Some(concept.id),
            ..SchemaField::new(FieldKind::Order)
        });
        self.elements.push(FormElement::Order(OrderElement {
            field_name: field_name.clone(),
            concept: concept.id,
            existing,
        }));
        self.widget_markup(&field_name);
        Ok(())
    }
}

/// Control ids declared by `<obs>` tags below `root`, in document order.
pub(crate) fn declared_control_ids(root: &Element) -> Vec<String> {
    let mut ids = Vec::new();
    root.visit(&mut |e| {
        if e.name == OBS {
            if let Some(id) = e.non_empty_attribute("controlId") {
                ids.push(id.to_owned());
            }
        }
    });
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parse;

    #[test]
    fn test_declared_control_ids_ignore_history_tags() {
        let root = parse(
            r#"<htmlform><obs conceptId="1" controlId="a"/><obsHistory controlId="a"/><obs conceptId="2"/></htmlform>"#,
        )
        .expect("parses");
        assert_eq!(declared_control_ids(&root), vec!["a"]);
    }

    #[test]
    fn test_select_style_rejects_unknown_styles() {
        let root = parse(r#"<htmlform style="checkbox"/>"#).expect("parses");
        assert!(matches!(
            select_style(&root),
            Err(FormError::InvalidAttribute { attribute, .. }) if attribute == "style"
        ));
    }

    #[test]
    fn test_number_attribute() {
        let root = parse(r#"<htmlform rows="4" cols="x"/>"#).expect("parses");
        assert_eq!(number_attribute::<u32>(&root, "rows").expect("valid"), Some(4));
        assert!(number_attribute::<u32>(&root, "cols").is_err());
        assert_eq!(number_attribute::<u32>(&root, "missing").expect("valid"), None);
    }
}
