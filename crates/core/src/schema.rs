//! Structural description of a form.
//!
//! The schema records what kinds of facts a template can produce and how they nest. It is
//! built while the template compiles and does not depend on the subject's stored data: a
//! dynamic repeat contributes its body once, however many copies are rendered.

use formentry_types::ConceptId;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Obs,
    EncounterDate,
    EncounterLocation,
    EncounterProvider,
    ProgramEnrollment,
    WorkflowState,
    Order,
}

/// A leaf fact declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SchemaField {
    pub kind: FieldKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<ConceptId>,
    /// Restricts the coded answers the field accepts; empty means unrestricted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<ConceptId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SchemaField {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            concept: None,
            answers: Vec::new(),
            control_id: None,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ObsGroupNode {
    pub grouping_concept: ConceptId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub children: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RepeatNode {
    pub id: String,
    pub children: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum SchemaNode {
    Field(SchemaField),
    ObsGroup(ObsGroupNode),
    Repeat(RepeatNode),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Section {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub nodes: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FormSchema {
    pub name: String,
    pub sections: Vec<Section>,
}

impl FormSchema {
    /// Every leaf field, in document order.
    pub fn fields(&self) -> Vec<&SchemaField> {
        fn walk<'a>(nodes: &'a [SchemaNode], out: &mut Vec<&'a SchemaField>) {
            for node in nodes {
                match node {
                    SchemaNode::Field(field) => out.push(field),
                    SchemaNode::ObsGroup(group) => walk(&group.children, out),
                    SchemaNode::Repeat(repeat) => walk(&repeat.children, out),
                }
            }
        }
        let mut out = Vec::new();
        for section in &self.sections {
            walk(&section.nodes, &mut out);
        }
        out
    }

    /// Concepts of the top-level observations this form can produce: ungrouped obs fields and
    /// outermost groups. Voiding these voids everything the form owns.
    pub fn top_level_obs_concepts(&self) -> BTreeSet<ConceptId> {
        fn walk(nodes: &[SchemaNode], out: &mut BTreeSet<ConceptId>) {
            for node in nodes {
                match node {
                    SchemaNode::Field(SchemaField {
                        kind: FieldKind::Obs,
                        concept: Some(concept),
                        ..
                    }) => {
                        out.insert(*concept);
                    }
                    SchemaNode::Field(_) => {}
                    SchemaNode::ObsGroup(group) => {
                        out.insert(group.grouping_concept);
                    }
                    SchemaNode::Repeat(repeat) => walk(&repeat.children, out),
                }
            }
        }
        let mut out = BTreeSet::new();
        for section in &self.sections {
            walk(&section.nodes, &mut out);
        }
        out
    }

    pub fn order_concepts(&self) -> BTreeSet<ConceptId> {
        self.fields()
            .into_iter()
            .filter(|f| f.kind == FieldKind::Order)
            .filter_map(|f| f.concept)
            .collect()
    }
}

enum OpenNode {
    Section(Section),
    Group(ObsGroupNode),
    Repeat(RepeatNode),
}

/// Stack-based builder driven by the compiler: every `begin_*` is matched by an `end_*`.
pub struct SchemaBuilder {
    name: String,
    sections: Vec<Section>,
    stack: Vec<OpenNode>,
    /// Non-zero while compiling repeat copies after the first.
    suppressed: usize,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sections: Vec::new(),
            stack: Vec::new(),
            suppressed: 0,
        }
    }

    pub fn begin_section(&mut self, label: Option<String>) {
        if self.suppressed == 0 {
            self.stack.push(OpenNode::Section(Section {
                label,
                nodes: Vec::new(),
            }));
        }
    }

    pub fn end_section(&mut self) {
        if self.suppressed == 0 {
            if let Some(OpenNode::Section(section)) = self.stack.pop() {
                self.sections.push(section);
            }
        }
    }

    pub fn begin_group(&mut self, grouping_concept: ConceptId, label: Option<String>) {
        if self.suppressed == 0 {
            self.stack.push(OpenNode::Group(ObsGroupNode {
                grouping_concept,
                label,
                children: Vec::new(),
            }));
        }
    }

    pub fn end_group(&mut self) {
        if self.suppressed == 0 {
            if let Some(OpenNode::Group(group)) = self.stack.pop() {
                self.attach(SchemaNode::ObsGroup(group));
            }
        }
    }

    pub fn begin_repeat(&mut self, id: impl Into<String>) {
        if self.suppressed == 0 {
            self.stack.push(OpenNode::Repeat(RepeatNode {
                id: id.into(),
                children: Vec::new(),
            }));
        }
    }

    pub fn end_repeat(&mut self) {
        if self.suppressed == 0 {
            if let Some(OpenNode::Repeat(repeat)) = self.stack.pop() {
                self.attach(SchemaNode::Repeat(repeat));
            }
        }
    }

    /// Stops recording until the matching [`SchemaBuilder::resume`].
    pub fn suppress(&mut self) {
        self.suppressed += 1;
    }

    pub fn resume(&mut self) {
        self.suppressed = self.suppressed.saturating_sub(1);
    }

    pub fn add_field(&mut self, field: SchemaField) {
        if self.suppressed == 0 {
            self.attach(SchemaNode::Field(field));
        }
    }

    fn attach(&mut self, node: SchemaNode) {
        match self.stack.last_mut() {
            Some(OpenNode::Section(section)) => section.nodes.push(node),
            Some(OpenNode::Group(group)) => group.children.push(node),
            Some(OpenNode::Repeat(repeat)) => repeat.children.push(node),
            None => match self.sections.last_mut() {
                Some(section) if section.label.is_none() => section.nodes.push(node),
                _ => self.sections.push(Section {
                    label: None,
                    nodes: vec![node],
                }),
            },
        }
    }

    /// Closes anything left open and returns the schema.
    pub fn finish(mut self) -> FormSchema {
        while let Some(open) = self.stack.pop() {
            match open {
                OpenNode::Section(section) => self.sections.push(section),
                OpenNode::Group(group) => self.attach(SchemaNode::ObsGroup(group)),
                OpenNode::Repeat(repeat) => self.attach(SchemaNode::Repeat(repeat)),
            }
        }
        FormSchema {
            name: self.name,
            sections: self.sections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(concept: u32) -> SchemaField {
        SchemaField {
            concept: Some(ConceptId::new(concept)),
            ..SchemaField::new(FieldKind::Obs)
        }
    }

    #[test]
    fn test_builder_nests_groups_inside_sections() {
        let mut builder = SchemaBuilder::new("Vitals");
        builder.add_field(SchemaField::new(FieldKind::EncounterDate));
        builder.begin_section(Some("History".into()));
        builder.begin_group(ConceptId::new(100), None);
        builder.add_field(obs(1));
        builder.end_group();
        builder.end_section();
        let schema = builder.finish();

        assert_eq!(schema.sections.len(), 2);
        assert_eq!(schema.sections[0].label, None);
        let SchemaNode::ObsGroup(group) = &schema.sections[1].nodes[0] else {
            panic!("expected a group");
        };
        assert_eq!(group.grouping_concept, ConceptId::new(100));
        assert_eq!(group.children, vec![SchemaNode::Field(obs(1))]);
    }

    #[test]
    fn test_suppressed_copies_are_not_recorded() {
        let mut builder = SchemaBuilder::new("Meds");
        builder.begin_repeat("meds");
        builder.add_field(obs(7));
        builder.suppress();
        builder.add_field(obs(7));
        builder.begin_group(ConceptId::new(9), None);
        builder.end_group();
        builder.resume();
        builder.end_repeat();
        let schema = builder.finish();

        let SchemaNode::Repeat(repeat) = &schema.sections[0].nodes[0] else {
            panic!("expected a repeat");
        };
        assert_eq!(repeat.children.len(), 1);
    }

    #[test]
    fn test_top_level_concepts_skip_group_members() {
        let mut builder = SchemaBuilder::new("F");
        builder.add_field(obs(1));
        builder.begin_group(ConceptId::new(100), None);
        builder.add_field(obs(2));
        builder.end_group();
        builder.add_field(SchemaField {
            concept: Some(ConceptId::new(50)),
            ..SchemaField::new(FieldKind::Order)
        });
        let schema = builder.finish();

        let concepts: Vec<u32> = schema.top_level_obs_concepts().iter().map(|c| c.get()).collect();
        assert_eq!(concepts, vec![1, 100]);
        assert_eq!(schema.order_concepts().len(), 1);
        assert_eq!(schema.fields().len(), 3);
    }
}
