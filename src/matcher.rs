//! Tolerant agent-name matching.
//!
//! Chat users rarely type an agent's display name exactly: "Agent Peter"
//! arrives as `AgentPeter`, `agent  peter`, or `agentpeter > hello`. The
//! matchers here accept those spellings without accepting anything that
//! merely shares a prefix with the name.
//!
//! Callers comparing a message against several agent names must try the
//! candidates longest-name-first, otherwise "Agent" shadows "Agent Peter".

/// Match `name` as a prefix of `text` and return the length of the
/// matched prefix in `text`, in bytes.
///
/// Two tolerances are applied in order:
/// 1. Exact case-insensitive match with the name's spacing preserved.
/// 2. Collapsed match where any space in the input is skipped, so the
///    name's internal spaces become optional.
///
/// Both require a word boundary (end of string, space, or newline)
/// immediately after the matched prefix.
pub fn match_name_prefix(text: &str, name: &str) -> Option<usize> {
    if name.trim().is_empty() {
        return None;
    }

    if let Some(len) = match_exact_prefix(text, name) {
        return Some(len);
    }
    match_collapsed_prefix(text, name)
}

/// Whole-string comparison used by the `"Name > rest"` inline-switch
/// syntax: lowercase both sides and strip all spaces before comparing.
pub fn matches_agent_name(text: &str, name: &str) -> bool {
    let collapse = |s: &str| {
        s.chars()
            .filter(|c| *c != ' ')
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    let lhs = collapse(text);
    !lhs.is_empty() && lhs == collapse(name)
}

/// Case-insensitive, space-preserving prefix match.
fn match_exact_prefix(text: &str, name: &str) -> Option<usize> {
    let mut text_iter = text.char_indices();
    for name_char in name.chars() {
        let (_, text_char) = text_iter.next()?;
        if !chars_eq_ignore_case(text_char, name_char) {
            return None;
        }
    }
    let end = text_iter.next().map_or(text.len(), |(idx, _)| idx);
    boundary_after(text, end).then_some(end)
}

/// Collapsed prefix match: the input is scanned character by character,
/// skipping any input space, failing on any other mismatch.
fn match_collapsed_prefix(text: &str, name: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut pos = 0usize;
    let mut end = 0usize;

    for name_char in name.chars().filter(|c| *c != ' ') {
        while pos < chars.len() && chars[pos].1 == ' ' {
            pos += 1;
        }
        let (idx, text_char) = *chars.get(pos)?;
        if !chars_eq_ignore_case(text_char, name_char) {
            return None;
        }
        end = idx + text_char.len_utf8();
        pos += 1;
    }

    boundary_after(text, end).then_some(end)
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// A matched prefix only counts when followed by end-of-string, a space,
/// or a newline.
fn boundary_after(text: &str, end: usize) -> bool {
    match text[end..].chars().next() {
        None => true,
        Some(c) => c == ' ' || c == '\n',
    }
}
