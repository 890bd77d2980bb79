//! Single-pass macro substitution.
//!
//! ```xml
//! <macros>
//!     weight=5089
//!     height=5090
//!     <macro key="bmi" value="1342"/>
//! </macros>
//! ```
//!
//! The block is removed and every `$weight` elsewhere in the text becomes `5089`. Values are
//! XML-escaped on insertion, so a value can never introduce a tag, and inserted text is never
//! scanned again. `logicTest` and `velocityTest` values are left alone: `$patient` there is a
//! script variable, not a macro.

use super::preprocess::test_value_ranges;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<macros\s*/>|<macros(?:\s[^>]*)?>(.*?)</macros\s*>")
            .expect("macros block regex must compile")
    })
}

fn macro_element_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<macro\s([^>]*?)/?>(?:\s*</macro\s*>)?").expect("macro regex must compile")
    })
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("attribute regex must compile")
    })
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Reads macro declarations from the body of a `<macros>` block.
///
/// Lines are `key=value` or `key: value`; blank lines and lines starting with `#` or `!` are
/// skipped. Anything else that does not parse is ignored with a warning.
pub fn parse_declarations(body: &str) -> BTreeMap<String, String> {
    let mut macros = BTreeMap::new();

    let lines = macro_element_regex().replace_all(body, |caps: &Captures<'_>| {
        let mut key = None;
        let mut value = None;
        for attr in attribute_regex().captures_iter(&caps[1]) {
            let text = attr
                .get(2)
                .or_else(|| attr.get(3))
                .map_or("", |m| m.as_str());
            match &attr[1] {
                "key" | "name" => key = Some(text.trim().to_owned()),
                "value" => value = Some(html_escape::decode_html_entities(text).into_owned()),
                _ => {}
            }
        }
        match (key, value) {
            (Some(key), Some(value)) if is_valid_key(&key) => {
                macros.insert(key, value);
            }
            _ => tracing::warn!("ignoring malformed macro element: {}", &caps[0]),
        }
        String::new()
    });

    for line in lines.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line.find(['=', ':']);
        let Some(at) = split else {
            tracing::warn!("ignoring malformed macro line: {line}");
            continue;
        };
        let key = line[..at].trim();
        let value = line[at + 1..].trim();
        if !is_valid_key(key) {
            tracing::warn!("ignoring malformed macro line: {line}");
            continue;
        }
        macros.insert(key.to_owned(), html_escape::decode_html_entities(value).into_owned());
    }
    macros
}

/// Removes the first `<macros>` block and substitutes its declarations, once.
///
/// Without a block the text is returned unchanged.
pub fn expand_macros(text: &str) -> String {
    let Some(block) = block_regex().captures(text) else {
        return text.to_owned();
    };
    let whole = block.get(0).map_or(0..0, |m| m.range());
    let declarations = parse_declarations(block.get(1).map_or("", |m| m.as_str()));

    let mut without_block = String::with_capacity(text.len());
    without_block.push_str(&text[..whole.start]);
    without_block.push_str(&text[whole.end..]);

    if declarations.is_empty() {
        return without_block;
    }

    // Longer keys first, so `$weight_kg` is not read as `$weight` followed by `_kg`.
    let mut keys: Vec<&String> = declarations.keys().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let alternation = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    let Ok(usage) = Regex::new(&format!(r"\$({alternation})")) else {
        tracing::warn!("macro names could not be compiled into a pattern; skipping expansion");
        return without_block;
    };

    let tests = test_value_ranges(&without_block);
    usage
        .replace_all(&without_block, |caps: &Captures<'_>| {
            let at = caps.get(0).map_or(0, |m| m.start());
            if tests.iter().any(|r| r.contains(&at)) {
                return caps[0].to_owned();
            }
            declarations
                .get(&caps[1])
                .map(|value| html_escape::encode_quoted_attribute(value).into_owned())
                .unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}
