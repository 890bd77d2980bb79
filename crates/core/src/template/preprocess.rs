//! Text passes run before the template is parsed.

use crate::constants::VOID_ELEMENTS;
use crate::expression::{LOGIC_TEST_ATTRIBUTE, SCRIPT_TEST_ATTRIBUTE};
use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::OnceLock;

const XML_PREDEFINED_ENTITIES: &[&str] = &["amp", "lt", "gt", "quot", "apos"];

fn comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<!\s*--.*?--\s*>").expect("comment regex must compile")
    })
}

fn entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&([A-Za-z][A-Za-z0-9]*);").expect("entity regex must compile")
    })
}

fn void_open_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names = VOID_ELEMENTS.join("|");
        Regex::new(&format!(r"(?i)<({names})\b([^>]*?)/?\s*>"))
            .expect("void element regex must compile")
    })
}

fn void_close_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names = VOID_ELEMENTS.join("|");
        Regex::new(&format!(r"(?i)</({names})\s*>")).expect("void element regex must compile")
    })
}

/// Removes `<!-- ... -->` comments. Comments do not nest; running this twice changes nothing.
pub fn strip_comments(text: &str) -> String {
    comment_regex().replace_all(text, "").into_owned()
}

/// Rewrites HTML named character references that XML does not define (`&nbsp;`) as numeric
/// references (`&#160;`). Unknown names are left for the parser to report.
pub fn substitute_character_codes(text: &str) -> String {
    entity_regex()
        .replace_all(text, |caps: &Captures<'_>| {
            let whole = &caps[0];
            if XML_PREDEFINED_ENTITIES.contains(&&caps[1]) {
                return whole.to_owned();
            }
            let decoded = html_escape::decode_html_entities(whole);
            if decoded == whole {
                tracing::warn!("unknown character reference {whole} left unchanged");
                return whole.to_owned();
            }
            decoded.chars().map(|c| format!("&#{};", c as u32)).collect()
        })
        .into_owned()
}

/// Rewrites `<br>`, `<BR></BR>`, `<hr >` and friends to a single self-closed element.
pub fn normalize_void_elements(text: &str) -> String {
    let opened = void_open_regex().replace_all(text, |caps: &Captures<'_>| {
        format!("<{}{}/>", &caps[1], caps[2].trim_end())
    });
    void_close_regex().replace_all(&opened, "").into_owned()
}

/// Locates the raw value of the first `logicTest`/`velocityTest` attribute in `text`.
///
/// The value runs from the opening quote to the next quote of the same kind, so comparison
/// operators inside it are never mistaken for tag boundaries.
pub fn extract_test_expression(text: &str) -> Option<&str> {
    test_value_ranges(text).into_iter().next().map(|r| &text[r])
}

/// Byte ranges of the raw values of every test attribute in `text`.
pub(crate) fn test_value_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    for attribute in [LOGIC_TEST_ATTRIBUTE, SCRIPT_TEST_ATTRIBUTE] {
        let mut from = 0;
        while let Some(offset) = text[from..].find(attribute) {
            let start = from + offset;
            from = start + attribute.len();
            let preceded_by_space = text[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
            if !preceded_by_space {
                continue;
            }
            if let Some(range) = quoted_value_after(text, from) {
                from = range.end;
                ranges.push(range);
            }
        }
    }
    ranges.sort_by_key(|r| r.start);
    ranges
}

/// Finds `= "value"` (or single-quoted) starting at `at`, returning the range inside the quotes.
fn quoted_value_after(text: &str, at: usize) -> Option<Range<usize>> {
    let rest = &text[at..];
    let after_name = rest.trim_start();
    let after_eq = after_name.strip_prefix('=')?.trim_start();
    let quote = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value_start = text.len() - after_eq.len() + quote.len_utf8();
    let value_len = text[value_start..].find(quote)?;
    Some(value_start..value_start + value_len)
}

/// Escapes `<`, `>` and bare `&` inside test attribute values so the XML parser accepts them.
pub fn escape_test_expressions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for range in test_value_ranges(text) {
        out.push_str(&text[last..range.start]);
        out.push_str(&escape_expression(&text[range.clone()]));
        last = range.end;
    }
    out.push_str(&text[last..]);
    out
}

fn escape_expression(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, c) in raw.char_indices() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' if !starts_entity(&raw[i..]) => out.push_str("&amp;"),
            other => out.push(other),
        }
    }
    out
}

fn starts_entity(text: &str) -> bool {
    let Some(end) = text.find(';') else {
        return false;
    };
    let body = &text[1..end];
    let named = !body.is_empty() && body.chars().all(|c| c.is_ascii_alphanumeric());
    let numeric = body
        .strip_prefix('#')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_hexdigit() || c == 'x'));
    named || numeric
}
