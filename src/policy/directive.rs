//! Parsing, encoding and stripping of the cache policy comment line

use crate::error::{CacheError, Result};
use crate::policy::timespan::{format_timespan, parse_timespan};
use crate::policy::{CachePolicy, ExpirationMode};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::{debug, warn};

/// Marker token that opens a policy directive
pub const CACHE_POLICY_MARKER: &str = "EFCachePolicy";

const PARTS_SEPARATOR: &str = "-->";
const FIELD_SEPARATOR: char = '|';
const DEPENDENCY_SEPARATOR: &str = ",";

static DIRECTIVE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:--[ \t]*)?EFCachePolicy\[(?P<origin>[^\]\r\n]*)\][ \t]*-->(?P<fields>[^\r\n]*)")
        .expect("invalid directive regex")
});

/// A directive located in command text
struct DirectiveMatch<'a> {
    /// The directive line, without its line terminator
    line: Range<usize>,
    fields: &'a str,
}

fn find_directive(command_text: &str) -> Option<DirectiveMatch<'_>> {
    let caps = DIRECTIVE_REGEX.captures(command_text)?;
    let whole = caps.get(0)?;
    let fields = caps.name("fields")?.as_str();
    Some(DirectiveMatch {
        line: whole.start()..whole.end(),
        fields,
    })
}

/// Parse the policy directive in `command_text`.
///
/// Returns `Ok(None)` when no directive is present. A directive with a malformed
/// expiration mode, timeout or cacheable flag is an error, never a silent default.
pub fn parse_policy(command_text: &str) -> Result<Option<CachePolicy>> {
    let Some(found) = find_directive(command_text) else {
        return Ok(None);
    };

    let policy = parse_fields(found.fields).map_err(|e| {
        warn!("Rejecting cache policy directive: {}", e);
        e
    })?;
    debug!("Parsed cache policy directive: {:?}", policy);
    Ok(Some(policy))
}

/// True only if a directive is present and marks the command cacheable
pub fn is_explicitly_cacheable(command_text: &str) -> Result<bool> {
    Ok(parse_policy(command_text)?.is_some_and(|p| p.is_cacheable()))
}

fn parse_fields(fields: &str) -> Result<CachePolicy> {
    let parts: Vec<&str> = fields.split(FIELD_SEPARATOR).map(str::trim).collect();

    if parts.len() > 5 {
        return Err(CacheError::MalformedDirective(format!(
            "expected at most 5 fields, found {}",
            parts.len()
        )));
    }

    let field = |i: usize| parts.get(i).copied().unwrap_or("");

    let expiration_mode: ExpirationMode = field(0).parse()?;

    let timeout = match field(1) {
        "" => None,
        value => Some(parse_timespan(value)?),
    };

    let extra_dependencies: BTreeSet<String> = field(3)
        .split(DEPENDENCY_SEPARATOR)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();

    let is_cacheable = match field(4) {
        "" => true,
        v if v.eq_ignore_ascii_case("true") => true,
        v if v.eq_ignore_ascii_case("false") => false,
        other => return Err(CacheError::InvalidCacheableFlag(other.to_string())),
    };

    Ok(CachePolicy::new(expiration_mode, timeout)
        .with_salt_key(field(2))
        .with_extra_dependencies(extra_dependencies)
        .with_cacheable(is_cacheable))
}

/// Encode a policy as a directive comment line (no line terminator).
///
/// Parsing trims every field, so a salt or dependency with surrounding whitespace
/// could not come back unchanged and is rejected, as is an empty dependency.
pub(crate) fn encode_policy(policy: &CachePolicy, origin: &str) -> Result<String> {
    let forbidden = |s: &str| {
        s.contains(FIELD_SEPARATOR) || s.contains('\n') || s.contains('\r') || s.trim() != s
    };

    if origin.contains(']') || origin.contains('\n') || origin.contains('\r') {
        return Err(CacheError::MalformedDirective(format!(
            "origin {:?} cannot be encoded",
            origin
        )));
    }
    if forbidden(policy.salt_key()) {
        return Err(CacheError::MalformedDirective(format!(
            "salt key {:?} cannot be encoded",
            policy.salt_key()
        )));
    }
    if let Some(bad) = policy
        .extra_dependencies()
        .iter()
        .find(|d| d.is_empty() || forbidden(d) || d.contains(DEPENDENCY_SEPARATOR))
    {
        return Err(CacheError::MalformedDirective(format!(
            "dependency {:?} cannot be encoded",
            bad
        )));
    }

    let timeout = policy.timeout().map(format_timespan).unwrap_or_default();
    let dependencies = policy
        .extra_dependencies()
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(DEPENDENCY_SEPARATOR);
    let cacheable = if policy.is_cacheable() { "True" } else { "False" };

    Ok(format!(
        "-- {}[{}] {} {}|{}|{}|{}|{}",
        CACHE_POLICY_MARKER,
        origin,
        PARTS_SEPARATOR,
        policy.expiration_mode(),
        timeout,
        policy.salt_key(),
        dependencies,
        cacheable
    ))
}

/// Remove the directive line and exactly one line terminator, leaving every other
/// byte untouched. Text without a directive is returned unchanged.
pub fn strip_policy_directive(command_text: &str) -> String {
    let Some(found) = find_directive(command_text) else {
        return command_text.to_string();
    };

    let Range { mut start, mut end } = found.line;
    let rest = &command_text[end..];

    if rest.starts_with("\r\n") {
        end += 2;
    } else if rest.starts_with('\n') {
        end += 1;
    } else {
        // Last line: take the terminator in front of it instead
        let before = &command_text[..start];
        if before.ends_with("\r\n") {
            start -= 2;
        } else if before.ends_with('\n') {
            start -= 1;
        }
    }

    let mut out = String::with_capacity(command_text.len() - (end - start));
    out.push_str(&command_text[..start]);
    out.push_str(&command_text[end..]);
    out
}
