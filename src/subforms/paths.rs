//! Path bookkeeping for directive nodes.
//!
//! Paths handled here are absolute instance paths such as
//! `/household/member[2]/name` (as reported by the form engine) or their
//! stripped form `/member[2]/name`.
//!
//! Nested repeats are a known limitation: `/visit[2]/sample[3]/id` yields
//! repeat index 3 (the largest selector), and renumbering rewrites only the
//! last selector carrying the old index. Neither is well-defined when both
//! levels repeat.

use regex::Regex;
use std::sync::LazyLock;

/// Marker the form engine puts in paths of repeat template placeholders.
pub const TEMPLATE_MARKER: &str = "[@template]";

static BRACKET_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("static regex"));

/// Drop the leading instance-name segment so paths compare across forms.
/// `/household/member[1]/name` becomes `/member[1]/name`; the root becomes `/`.
pub fn strip_instance_name(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => trimmed[idx..].to_string(),
        None => "/".to_string(),
    }
}

pub fn is_template(path: &str) -> bool {
    path.contains(TEMPLATE_MARKER)
}

/// Largest bracketed integer selector in `path`, if any.
pub fn max_bracket_index(path: &str) -> Option<i64> {
    BRACKET_INDEX
        .captures_iter(path)
        .filter_map(|c| c[1].parse::<i64>().ok())
        .max()
}

/// Rewrite the last `[old]` selector in `path` to `[new]`.
/// Paths without an `[old]` selector come back unchanged.
pub fn rewrite_repeat_index(path: &str, old: i64, new: i64) -> String {
    let last = BRACKET_INDEX
        .captures_iter(path)
        .filter(|c| c[1].parse::<i64>().ok() == Some(old))
        .last();
    match last.and_then(|c| c.get(0)) {
        Some(m) => format!("{}[{}]{}", &path[..m.start()], new, &path[m.end()..]),
        None => path.to_string(),
    }
}
