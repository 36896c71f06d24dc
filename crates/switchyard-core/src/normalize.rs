// ABOUTME: One-shot reply normalizer for fully buffered backend output
// ABOUTME: Strips bold prefaces, leaked style tokens with doubled answers, and reasoning traces

use regex::Regex;
use std::sync::LazyLock;

/// Bold text glued to an answer that starts with a letter or digit.
/// Punctuation after the bold text is a separator, not an answer.
static BOLD_PREFACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*\*\*[^*\n]+\*\*([\p{L}\p{N}].*)$").expect("bold preface pattern")
});

/// Literal tokens some backends leak in front of a one-shot reply (the
/// configured output style name).
const LEAKED_PREFIXES: &[&str] = &["default"];

/// Clean up a complete reply before handing it to a caller that wants one
/// answer. At most one rule applies, checked in this order:
///
/// 1. `**Preface**Answer` with no separator keeps `Answer`.
/// 2. A leaked prefix followed by a doubled answer (`defaultOKOK`) keeps one copy.
/// 3. Multi-line text keeps only its last non-empty line.
/// 4. Anything else is returned unchanged.
pub fn normalize_one_shot(text: &str) -> String {
    if let Some(answer) = strip_bold_preface(text) {
        return answer;
    }
    if let Some(answer) = strip_leaked_duplicate(text) {
        return answer;
    }
    if text.trim().contains('\n') {
        if let Some(last) = text.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            return last.to_string();
        }
    }
    text.to_string()
}

fn strip_bold_preface(text: &str) -> Option<String> {
    let caps = BOLD_PREFACE.captures(text)?;
    Some(caps.get(1)?.as_str().trim().to_string())
}

fn strip_leaked_duplicate(text: &str) -> Option<String> {
    let rest = LEAKED_PREFIXES
        .iter()
        .find_map(|prefix| text.strip_prefix(prefix))?;
    collapse_doubled(rest).map(str::to_string)
}

/// `"abcabc"` → `Some("abc")`; anything that is not exactly two copies → `None`.
fn collapse_doubled(text: &str) -> Option<&str> {
    let chars = text.chars().count();
    if chars == 0 || chars % 2 != 0 {
        return None;
    }
    let mid = text.char_indices().nth(chars / 2).map(|(i, _)| i)?;
    let (first, second) = text.split_at(mid);
    (first == second).then_some(first)
}
