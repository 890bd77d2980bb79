//! Template text handling: preprocessing passes over the raw text, the owned node tree the
//! compiler walks, and the tree passes that resolve conditionals and unroll repeats.

pub mod conditional;
pub mod macros;
pub mod preprocess;
pub mod repeat;

use crate::constants::ROOT_TAG;
use crate::{FormError, FormResult};

/// One node of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    Element(Element),
    Text(String),
}

/// An element with its attributes in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<TemplateNode>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The attribute value, treating blank values as absent.
    pub fn non_empty_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name).map(str::trim).filter(|v| !v.is_empty())
    }

    /// # Errors
    ///
    /// Returns `FormError::MissingAttribute` naming this tag when the attribute is absent or
    /// blank.
    pub fn required_attribute(&self, name: &str) -> FormResult<&str> {
        self.non_empty_attribute(name)
            .ok_or_else(|| FormError::missing(&self.name, name))
    }

    /// Reads a `true`/`false` attribute; absent means `default`.
    pub fn bool_attribute(&self, name: &str, default: bool) -> FormResult<bool> {
        match self.non_empty_attribute(name) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(FormError::invalid(&self.name, name, v)),
        }
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name.to_owned(), value)),
        }
    }

    /// Child elements, skipping text.
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            TemplateNode::Element(element) => Some(element),
            TemplateNode::Text(_) => None,
        })
    }

    /// Applies `f` to this element and every descendant element, parents first.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Element)) {
        f(self);
        for child in &mut self.children {
            if let TemplateNode::Element(element) = child {
                element.visit_mut(f);
            }
        }
    }

    /// Visits this element and every descendant element, parents first.
    pub fn visit(&self, f: &mut impl FnMut(&Element)) {
        f(self);
        for child in self.child_elements() {
            child.visit(f);
        }
    }

    /// Replaces `{key}` placeholders in attribute values and text below this element.
    pub fn replace_placeholders(&mut self, replacements: &[(String, String)]) {
        fn apply(text: &mut String, replacements: &[(String, String)]) {
            for (key, value) in replacements {
                let placeholder = format!("{{{key}}}");
                if text.contains(&placeholder) {
                    *text = text.replace(&placeholder, value);
                }
            }
        }

        for (_, value) in &mut self.attributes {
            apply(value, replacements);
        }
        for child in &mut self.children {
            match child {
                TemplateNode::Element(element) => element.replace_placeholders(replacements),
                TemplateNode::Text(text) => apply(text, replacements),
            }
        }
    }
}

/// Runs every text pass over raw template text, in order: character references, comments,
/// test expression escaping, void elements, macros.
pub fn preprocess(text: &str) -> String {
    let text = preprocess::substitute_character_codes(text);
    let text = preprocess::strip_comments(&text);
    let text = preprocess::escape_test_expressions(&text);
    let text = preprocess::normalize_void_elements(&text);
    macros::expand_macros(&text)
}

/// Parse preprocessed template text into an owned tree rooted at `<htmlform>`.
///
/// # Errors
///
/// Returns `FormError::MalformedTemplate` if the text is not well-formed or the root element is
/// not `htmlform`.
pub fn parse(text: &str) -> FormResult<Element> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let document = roxmltree::Document::parse_with_options(text, options)
        .map_err(|e| FormError::MalformedTemplate(e.to_string()))?;
    let root = document.root_element();
    if root.tag_name().name() != ROOT_TAG {
        return Err(FormError::MalformedTemplate(format!(
            "root element must be <{ROOT_TAG}>, found <{}>",
            root.tag_name().name()
        )));
    }
    Ok(convert(root))
}

fn convert(node: roxmltree::Node<'_, '_>) -> Element {
    let mut element = Element::new(node.tag_name().name());
    element.attributes = node
        .attributes()
        .map(|a| (a.name().to_owned(), a.value().to_owned()))
        .collect();
    for child in node.children() {
        if child.is_element() {
            element.children.push(TemplateNode::Element(convert(child)));
        } else if child.is_text() {
            if let Some(text) = child.text() {
                element.children.push(TemplateNode::Text(text.to_owned()));
            }
        }
    }
    element
}
