//! Classification code normalization
//!
//! Thematic objectives and investment priorities arrive as free text such as
//! `"(1)Research and innovation"` or `"(4a Promoting energy efficiency"`.
//! Both are rewritten to `"(<nn>)<label>"` so that a plain string sort
//! orders them by number.
//!
//! One rule is used for both fields: every parenthesised number (closing
//! parenthesis optional) is removed from the label, and the first such
//! number becomes the zero-padded key. A single lowercase letter closed by a
//! parenthesis right after the number (`(4a)`) stays in the key, otherwise
//! sub-priorities `4a` and `4b` would collapse. Codes with no parenthesised
//! number fall back to the first bare number, which is left in the label.

use once_cell::sync::Lazy;
use regex::Regex;

static CODE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(([0-9]+)(?:([a-z])\))?\)?").expect("code token pattern is valid")
});

static BARE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+").expect("number pattern is valid"));

/// Normalize one code. `None` when the text holds no number at all.
pub fn normalize_code(raw: &str) -> Option<String> {
    let (number, suffix) = match CODE_TOKEN.captures(raw) {
        Some(caps) => (
            caps.get(1)?.as_str(),
            caps.get(2).map_or("", |m| m.as_str()),
        ),
        None => (BARE_NUMBER.find(raw)?.as_str(), ""),
    };
    let label = CODE_TOKEN.replace_all(raw, "");
    Some(format!("({:0>2}{}){}", number, suffix, label))
}

/// Null-propagating variant used on nullable source columns
pub fn normalize_optional(raw: Option<&str>) -> Option<String> {
    raw.and_then(normalize_code)
}

/// Width of the destination text column holding normalized codes.
///
/// Counts characters, a null counts as one, and the result is never zero so
/// the `VARCHAR(n)` declaration stays valid on an empty table.
pub fn code_column_width<'a, I>(values: I) -> usize
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    values
        .into_iter()
        .map(|v| v.map_or(1, |s| s.chars().count()))
        .max()
        .unwrap_or(1)
        .max(1)
}
