//! Unrolling of `<repeat>` constructs.
//!
//! A static repeat carries its own data:
//!
//! ```xml
//! <repeat>
//!     <template><obs conceptId="{concept}" labelText="{label}"/></template>
//!     <render concept="5089" label="Weight"/>
//!     <render concept="5090" label="Height"/>
//! </repeat>
//! ```
//!
//! A dynamic repeat has an `id` and a body, and is copied as many times as the session asks
//! for. In copy *i*, `{n}` placeholders read *i* and every `controlId` gains the suffix `-i`, so
//! each copy stays independently addressable.

use super::{Element, TemplateNode};
use crate::constants::DEFAULT_REPEAT_MAX;
use crate::{FormError, FormResult};

pub const REPEAT: &str = "repeat";
pub const TEMPLATE: &str = "template";
pub const RENDER: &str = "render";
/// Container left in the tree for an expanded dynamic repeat.
pub const DYNAMIC_REPEAT: &str = "dynamicRepeat";
/// Wrapper around one copy of a dynamic repeat's body.
pub const REPEAT_INSTANCE: &str = "repeatInstance";

/// Parsed attributes of a dynamic repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRepeat {
    pub id: String,
    pub min: usize,
    pub max: usize,
}

impl DynamicRepeat {
    pub fn from_element(element: &Element) -> FormResult<Self> {
        let id = element.required_attribute("id")?.to_owned();
        let min = count_attribute(element, "min")?.unwrap_or(1);
        let max = count_attribute(element, "max")?.unwrap_or(DEFAULT_REPEAT_MAX);
        if min == 0 {
            return Err(FormError::invalid(&element.name, "min", "0"));
        }
        if max < min {
            return Err(FormError::invalid(&element.name, "max", &max.to_string()));
        }
        Ok(Self { id, min, max })
    }

    /// Field name of the hidden widget that carries the number of copies.
    pub fn count_field_name(&self) -> String {
        format!("repeat-{}-count", self.id)
    }

    pub fn clamp(&self, wanted: usize) -> usize {
        wanted.clamp(self.min, self.max)
    }
}

fn count_attribute(element: &Element, name: &str) -> FormResult<Option<usize>> {
    element
        .non_empty_attribute(name)
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| FormError::invalid(&element.name, name, v))
        })
        .transpose()
}

fn is_static(element: &Element) -> bool {
    element.child_elements().any(|c| c.name == TEMPLATE)
}

/// Replaces every static repeat below `root` with its rendered copies.
///
/// # Errors
///
/// Returns `FormError::MalformedTemplate` for a repeat that has `<render>` rows but no
/// `<template>`.
pub fn expand_static_repeats(root: &mut Element) -> FormResult<()> {
    let children = std::mem::take(&mut root.children);
    root.children = expand_static_nodes(children)?;
    Ok(())
}

fn expand_static_nodes(nodes: Vec<TemplateNode>) -> FormResult<Vec<TemplateNode>> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let TemplateNode::Element(mut element) = node else {
            out.push(node);
            continue;
        };
        if element.name != REPEAT {
            expand_static_repeats(&mut element)?;
            out.push(TemplateNode::Element(element));
            continue;
        }
        if !is_static(&element) {
            if element.child_elements().any(|c| c.name == RENDER) {
                return Err(FormError::MalformedTemplate(
                    "<repeat> with <render> rows must contain a <template>".into(),
                ));
            }
            expand_static_repeats(&mut element)?;
            out.push(TemplateNode::Element(element));
            continue;
        }

        let body: Vec<TemplateNode> = element
            .child_elements()
            .filter(|c| c.name == TEMPLATE)
            .flat_map(|t| t.children.iter().cloned())
            .collect();
        for render in element.child_elements().filter(|c| c.name == RENDER) {
            let mut copy = Element::new(TEMPLATE);
            copy.children = body.clone();
            copy.replace_placeholders(&render.attributes);
            out.extend(expand_static_nodes(copy.children)?);
        }
    }
    Ok(out)
}

/// Replaces every dynamic repeat below `root` with a [`DYNAMIC_REPEAT`] container holding
/// `count(repeat)` copies of its body.
///
/// `count` receives the parsed repeat and its unexpanded body, and returns the number of copies
/// wanted; the result is clamped to the repeat's `min`/`max`.
pub fn expand_dynamic_repeats(
    root: &mut Element,
    count: &mut impl FnMut(&DynamicRepeat, &Element) -> FormResult<usize>,
) -> FormResult<()> {
    for child in &mut root.children {
        let TemplateNode::Element(element) = child else {
            continue;
        };
        if element.name != REPEAT {
            expand_dynamic_repeats(element, count)?;
            continue;
        }

        let repeat = DynamicRepeat::from_element(element)?;
        let copies = repeat.clamp(count(&repeat, element)?);
        tracing::debug!("expanding repeat '{}' into {} copies", repeat.id, copies);

        let mut container = Element::new(DYNAMIC_REPEAT)
            .with_attribute("id", repeat.id.clone())
            .with_attribute("count", copies.to_string());
        for index in 0..copies {
            let mut instance = Element::new(REPEAT_INSTANCE).with_attribute("index", index.to_string());
            instance.children = element.children.clone();
            instance.replace_placeholders(&[("n".to_owned(), index.to_string())]);
            instance.visit_mut(&mut |e| {
                if let Some(control_id) = e.non_empty_attribute("controlId").map(str::to_owned) {
                    e.set_attribute("controlId", format!("{control_id}-{index}"));
                }
            });
            expand_dynamic_repeats(&mut instance, count)?;
            container.children.push(TemplateNode::Element(instance));
        }
        *element = container;
    }
    Ok(())
}
