//! Small string and path helpers shared by the dialers

use std::num::IntErrorKind;
use std::path::PathBuf;

use glob::MatchOptions;
use percent_encoding::percent_decode_str;
use tracing::debug;

/// Expand `$VAR` / `${VAR}` references and a leading `~`.
///
/// Unset variables are left in place, as is `~` when the home directory
/// cannot be determined.
pub fn expand_path(path: &str) -> PathBuf {
    let home = || dirs::home_dir().map(|h| h.to_string_lossy().into_owned());
    let expanded =
        shellexpand::full_with_context_no_errors(path, home, |name| std::env::var(name).ok());
    PathBuf::from(expanded.as_ref())
}

/// Permissive "non-zero string" flag interpretation.
///
/// Numeric strings are true when their value is not zero. Any other non-empty
/// string is true. Empty strings and numbers that overflow are false.
pub fn non_zero(s: &str) -> bool {
    match s.parse::<i64>() {
        Ok(n) => n != 0,
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => false,
            _ => !s.is_empty(),
        },
    }
}

/// Percent-decode URI user info. `None` if the result is not UTF-8.
pub fn percent_decode(input: &str) -> Option<String> {
    percent_decode_str(input)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Match `text` against an OpenSSH `*`/`?` pattern, case-insensitively.
///
/// Brackets are literal (`[host]:port` names), unlike in shell globs.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '[' || c == ']' {
            escaped.push('[');
            escaped.push(c);
            escaped.push(']');
        } else if c == '*' && escaped.ends_with('*') {
            // glob reserves `**` for path components
            continue;
        } else {
            escaped.push(c);
        }
    }

    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(&escaped) {
        Ok(pattern) => pattern.matches_with(text, options),
        Err(e) => {
            debug!("Ignoring invalid host pattern '{}': {}", pattern, e);
            false
        }
    }
}

/// Match a host against a list of host patterns.
///
/// The list matches when at least one positive pattern matches and no
/// negated (`!pattern`) entry does.
pub fn match_host_list<'a>(patterns: impl IntoIterator<Item = &'a str>, host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_match(negated, host) {
                return false;
            }
        } else if glob_match(pattern, host) {
            matched = true;
        }
    }
    matched
}
