//! Resolution of `includeIf`, `excludeIf` and `ifMode` blocks.
//!
//! Blocks are resolved outer-to-inner. A block that is dropped takes its whole subtree with it,
//! and tests inside it are never evaluated. A kept block is replaced by its children.

use super::{Element, TemplateNode};
use crate::context::Mode;
use crate::expression::{EvaluationContext, Expression, LOGIC_TEST_ATTRIBUTE, SCRIPT_TEST_ATTRIBUTE};
use crate::{FormError, FormResult};

pub const INCLUDE_IF: &str = "includeIf";
pub const EXCLUDE_IF: &str = "excludeIf";
pub const IF_MODE: &str = "ifMode";

/// Resolves every conditional block below `root`.
///
/// # Errors
///
/// Returns a structural error if a block has no test, the test is malformed, or a logic test
/// fails to evaluate. A script test that fails at runtime is treated as false.
pub fn resolve_conditionals(root: &mut Element, ctx: &EvaluationContext<'_>) -> FormResult<()> {
    let children = std::mem::take(&mut root.children);
    root.children = resolve_nodes(children, ctx)?;
    Ok(())
}

fn resolve_nodes(
    nodes: Vec<TemplateNode>,
    ctx: &EvaluationContext<'_>,
) -> FormResult<Vec<TemplateNode>> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let TemplateNode::Element(mut element) = node else {
            out.push(node);
            continue;
        };
        match block_outcome(&element, ctx)? {
            Some(true) => out.extend(resolve_nodes(element.children, ctx)?),
            Some(false) => {
                tracing::trace!("dropping <{}> block", element.name);
            }
            None => {
                resolve_conditionals(&mut element, ctx)?;
                out.push(TemplateNode::Element(element));
            }
        }
    }
    Ok(out)
}

/// `Some(keep)` for conditional blocks, `None` for anything else.
fn block_outcome(element: &Element, ctx: &EvaluationContext<'_>) -> FormResult<Option<bool>> {
    match element.name.as_str() {
        INCLUDE_IF => Ok(Some(evaluate_test(element, ctx)?)),
        EXCLUDE_IF => Ok(Some(!evaluate_test(element, ctx)?)),
        IF_MODE => {
            let wanted = element.required_attribute("mode")?;
            let mode: Mode = wanted
                .parse()
                .map_err(|_| FormError::invalid(&element.name, "mode", wanted))?;
            let include = element.bool_attribute("include", true)?;
            Ok(Some((mode == ctx.mode) == include))
        }
        _ => Ok(None),
    }
}

fn evaluate_test(element: &Element, ctx: &EvaluationContext<'_>) -> FormResult<bool> {
    let expression = if let Some(source) = element.attribute(LOGIC_TEST_ATTRIBUTE) {
        Expression::from_attribute(LOGIC_TEST_ATTRIBUTE, source)?
    } else if let Some(source) = element.attribute(SCRIPT_TEST_ATTRIBUTE) {
        Expression::from_attribute(SCRIPT_TEST_ATTRIBUTE, source)?
    } else {
        return Err(FormError::missing(
            &element.name,
            &format!("{LOGIC_TEST_ATTRIBUTE} or {SCRIPT_TEST_ATTRIBUTE}"),
        ));
    };
    // Script tests that fail at runtime count as false; logic tests stay strict.
    let result = match expression.evaluate(ctx) {
        Ok(result) => result,
        Err(err) if matches!(expression, Expression::Script(_)) => {
            tracing::warn!("<{}> {err}; treating the test as false", element.name);
            false
        }
        Err(err) => return Err(err),
    };
    tracing::debug!(
        "<{}> {} test '{}' evaluated to {}",
        element.name,
        expression.dialect(),
        expression.source(),
        result
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::tests::subject;
    use crate::template::parse;

    fn resolve(template: &str, mode: Mode) -> FormResult<Element> {
        let s = subject("F", "1990-01-01");
        let ctx = EvaluationContext {
            subject: &s,
            today: "2024-06-01".parse().expect("date"),
            mode,
        };
        let mut root = parse(template)?;
        resolve_conditionals(&mut root, &ctx)?;
        Ok(root)
    }

    fn texts(root: &Element) -> String {
        fn collect(element: &Element, out: &mut String) {
            for child in &element.children {
                match child {
                    TemplateNode::Text(t) => out.push_str(t),
                    TemplateNode::Element(e) => collect(e, out),
                }
            }
        }
        let mut out = String::new();
        collect(root, &mut out);
        out
    }

    fn block(kind: &str, value: bool, inner: &str) -> String {
        format!(r#"<{kind} velocityTest="{value}">{inner}</{kind}>"#)
    }

    fn keeps(kind: &str, value: bool) -> bool {
        (kind == INCLUDE_IF) == value
    }

    #[test]
    fn test_two_level_truth_table() {
        for outer_kind in [INCLUDE_IF, EXCLUDE_IF] {
            for inner_kind in [INCLUDE_IF, EXCLUDE_IF] {
                for outer in [true, false] {
                    for inner in [true, false] {
                        let template = format!(
                            "<htmlform>{}</htmlform>",
                            block(outer_kind, outer, &block(inner_kind, inner, "X"))
                        );
                        let root = resolve(&template, Mode::Enter).expect("resolves");
                        let expected = keeps(outer_kind, outer) && keeps(inner_kind, inner);
                        assert_eq!(texts(&root) == "X", expected, "{template}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_three_level_truth_table() {
        for bits in 0..8u8 {
            let (a, b, c) = (bits & 4 != 0, bits & 2 != 0, bits & 1 != 0);
            let template = format!(
                "<htmlform>{}</htmlform>",
                block(
                    INCLUDE_IF,
                    a,
                    &format!("A{}", block(EXCLUDE_IF, b, &format!("B{}", block(INCLUDE_IF, c, "C"))))
                )
            );
            let root = resolve(&template, Mode::Enter).expect("resolves");
            let mut expected = String::new();
            if a {
                expected.push('A');
                if !b {
                    expected.push('B');
                    if c {
                        expected.push('C');
                    }
                }
            }
            assert_eq!(texts(&root), expected, "{template}");
        }
    }

    #[test]
    fn test_suppressed_block_does_not_evaluate_inner_tests() {
        let template = r#"<htmlform><includeIf velocityTest="false"><includeIf velocityTest="$nope == 1">X</includeIf></includeIf></htmlform>"#;
        let root = resolve(template, Mode::Enter).expect("inner test never runs");
        assert!(root.children.is_empty());
    }

    #[test]
    fn test_logic_dialect_block() {
        let template = r#"<htmlform><includeIf logicTest="GENDER = F">woman</includeIf><includeIf logicTest="GENDER = M">man</includeIf></htmlform>"#;
        let root = resolve(template, Mode::Enter).expect("resolves");
        assert_eq!(texts(&root), "woman");
    }

    #[test]
    fn test_missing_test_attribute_is_structural() {
        let err = resolve("<htmlform><includeIf>x</includeIf></htmlform>", Mode::Enter).unwrap_err();
        assert!(matches!(err, FormError::MissingAttribute { tag, .. } if tag == "includeIf"));
    }

    #[test]
    fn test_if_mode_blocks() {
        let template = r#"<htmlform><ifMode mode="VIEW">view</ifMode><ifMode mode="view" include="false">edit</ifMode></htmlform>"#;
        assert_eq!(texts(&resolve(template, Mode::View).expect("resolves")), "view");
        assert_eq!(texts(&resolve(template, Mode::Edit).expect("resolves")), "edit");
    }

    #[test]
    fn test_failing_script_test_counts_as_false() {
        let mut s = crate::expression::tests::subject("F", "1990-01-01");
        s.birthdate = None;
        let ctx = EvaluationContext {
            subject: &s,
            today: "2024-06-01".parse().expect("date"),
            mode: Mode::Enter,
        };
        let mut root = parse(
            r#"<htmlform><includeIf velocityTest="$patient.age &gt;= 18">adult</includeIf><excludeIf velocityTest="$patient.age &gt;= 18">shown</excludeIf></htmlform>"#,
        )
        .expect("parses");

        resolve_conditionals(&mut root, &ctx).expect("runtime failure is not structural");

        assert_eq!(texts(&root), "shown");
    }

    #[test]
    fn test_malformed_script_test_is_structural() {
        let err = resolve(r#"<htmlform><includeIf velocityTest="1 &lt;">x</includeIf></htmlform>"#, Mode::Enter)
            .unwrap_err();
        assert!(matches!(err, FormError::InvalidExpression { .. }));
    }

    #[test]
    fn test_empty_block_is_not_an_error() {
        let root = resolve(r#"<htmlform><includeIf velocityTest="true"/></htmlform>"#, Mode::Enter)
            .expect("resolves");
        assert!(root.children.is_empty());
    }
}
