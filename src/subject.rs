//! Subject wildcard matching.
//!
//! Subjects are dot-separated tokens. In a pattern, `*` matches exactly
//! one token and a trailing `>` matches one or more remaining tokens.

/// Returns `true` if `subject` is matched by `pattern`.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    // ---
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(token)) if !token.is_empty() => {}
            (Some(p), Some(s)) if p == s && !p.is_empty() => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns `true` if `filter` is usable as a consumer filter subject.
///
/// Tokens must be non-empty and free of whitespace, wildcards must stand
/// alone as a token, and `>` may only be the last token.
pub(crate) fn is_valid_filter(filter: &str) -> bool {
    // ---
    let mut tokens = filter.split('.').peekable();
    while let Some(token) = tokens.next() {
        let well_formed = match token {
            "" => false,
            "*" => true,
            ">" => tokens.peek().is_none(),
            _ => !token.contains(['*', '>']) && !token.contains(char::is_whitespace),
        };
        if !well_formed {
            return false;
        }
    }
    true
}

/// Returns `true` if any stream subject covers `filter`.
///
/// Wildcards in `filter` are compared as literal tokens, so `orders.>`
/// covers `orders.*` but `orders.new` does not.
pub(crate) fn covers(stream_subjects: &[String], filter: &str) -> bool {
    stream_subjects
        .iter()
        .any(|s| s == filter || subject_matches(s, filter))
}
