//! Subject addressing.
//!
//! Subjects are dot-separated token strings. Two addressing forms are built here:
//!
//! - Topic: `{env}.{app}.{topic}` where `topic` may itself contain dots
//! - Event: `{env}.events.{domain}.{resource}.{action}`
//!
//! Wildcards follow broker semantics: `*` matches exactly one token, `>` matches
//! one or more trailing tokens and is only legal as the final token.
//!
//! Every function here is pure. Malformed input yields `None` / `false`.

use sha2::{Digest, Sha256};

/// Token separator.
pub const SEPARATOR: char = '.';
/// Single-token wildcard.
pub const SINGLE_WILDCARD: &str = "*";
/// Trailing multi-token wildcard.
pub const TAIL_WILDCARD: &str = ">";
/// Second token of every event subject.
pub const EVENTS_TOKEN: &str = "events";

/// Components of a topic subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub env: String,
    pub app_name: String,
    pub topic: String,
}

/// Components of an event subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParts {
    pub env: String,
    pub domain: String,
    pub resource: String,
    pub action: String,
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '*' | '>' | '-')
}

/// Normalize one segment: lowercase, disallowed characters become `_`.
///
/// `.`, `*`, `>` and `-` are preserved, so a segment may carry several tokens.
pub fn normalize(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if is_allowed(c) { c } else { '_' })
        .collect()
}

/// Normalized segment whose tokens are all non-empty; empty tokens become `_`.
fn segment(raw: &str) -> String {
    normalize(raw)
        .split(SEPARATOR)
        .map(|token| if token.is_empty() { "_" } else { token })
        .collect::<Vec<_>>()
        .join(".")
}

/// Build a topic subject `{env}.{app}.{topic}`.
///
/// Blank segments and empty tokens become `_`, so the result never has an empty token.
pub fn build_topic(env: &str, app_name: &str, topic: &str) -> String {
    [env, app_name, topic]
        .iter()
        .map(|s| segment(s))
        .collect::<Vec<_>>()
        .join(".")
}

/// Build an event subject `{env}.events.{domain}.{resource}.{action}`.
pub fn build_event(env: &str, domain: &str, resource: &str, action: &str) -> String {
    [env, EVENTS_TOKEN, domain, resource, action]
        .iter()
        .map(|s| segment(s))
        .collect::<Vec<_>>()
        .join(".")
}

/// Parse a topic subject. Requires at least three tokens.
pub fn parse_topic(subject: &str) -> Option<TopicParts> {
    if !is_valid(subject) {
        return None;
    }
    let mut tokens = subject.splitn(3, SEPARATOR);
    let env = tokens.next()?;
    let app_name = tokens.next()?;
    let topic = tokens.next()?;
    Some(TopicParts {
        env: env.to_string(),
        app_name: app_name.to_string(),
        topic: topic.to_string(),
    })
}

/// Parse an event subject. Requires exactly five tokens with `events` second.
pub fn parse_event(subject: &str) -> Option<EventParts> {
    if !is_valid(subject) {
        return None;
    }
    let tokens: Vec<&str> = subject.split(SEPARATOR).collect();
    match tokens.as_slice() {
        [env, EVENTS_TOKEN, domain, resource, action] => Some(EventParts {
            env: env.to_string(),
            domain: domain.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
        }),
        _ => None,
    }
}

/// Check that a subject or pattern is normalized and well-formed.
///
/// Rejects empty tokens (which covers leading/trailing dots), characters outside
/// `[a-z0-9_.*>-]`, wildcards embedded inside a token, and `>` anywhere but last.
pub fn is_valid(subject: &str) -> bool {
    if subject.is_empty() || !subject.chars().all(is_allowed) {
        return false;
    }
    let tokens: Vec<&str> = subject.split(SEPARATOR).collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| {
        if token.is_empty() {
            return false;
        }
        if *token == TAIL_WILDCARD {
            return i == last;
        }
        if *token == SINGLE_WILDCARD {
            return true;
        }
        !token.contains(['*', '>'])
    })
}

/// True if the subject or pattern contains a wildcard token.
pub fn has_wildcard(subject: &str) -> bool {
    subject
        .split(SEPARATOR)
        .any(|t| t == SINGLE_WILDCARD || t == TAIL_WILDCARD)
}

/// Match a concrete subject against a pattern.
pub fn matches(pattern: &str, subject: &str) -> bool {
    if pattern.is_empty() || subject.is_empty() {
        return false;
    }
    let pattern: Vec<&str> = pattern.split(SEPARATOR).collect();
    let subject: Vec<&str> = subject.split(SEPARATOR).collect();

    for (i, token) in pattern.iter().enumerate() {
        match *token {
            TAIL_WILDCARD => return i == pattern.len() - 1 && subject.len() > i,
            SINGLE_WILDCARD => {
                if i >= subject.len() {
                    return false;
                }
            }
            literal => {
                if subject.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }
    pattern.len() == subject.len()
}

/// True if at least one concrete subject matches both patterns.
pub fn intersects(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split(SEPARATOR).collect();
    let b: Vec<&str> = b.split(SEPARATOR).collect();
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (None, None) => return true,
            // `>` needs at least one token on the other side
            (Some(&TAIL_WILDCARD), Some(_)) | (Some(_), Some(&TAIL_WILDCARD)) => return true,
            (Some(x), Some(y)) => {
                if *x != SINGLE_WILDCARD && *y != SINGLE_WILDCARD && x != y {
                    return false;
                }
            }
            _ => return false,
        }
        i += 1;
    }
}

/// True if every subject matched by `inner` is also matched by `outer`.
pub fn is_subset(inner: &str, outer: &str) -> bool {
    let inner: Vec<&str> = inner.split(SEPARATOR).collect();
    let outer: Vec<&str> = outer.split(SEPARATOR).collect();
    for (i, token) in outer.iter().enumerate() {
        let Some(candidate) = inner.get(i) else {
            return false;
        };
        match *token {
            TAIL_WILDCARD => return true,
            SINGLE_WILDCARD => {
                if *candidate == TAIL_WILDCARD {
                    return false;
                }
            }
            literal => {
                if *candidate != literal {
                    return false;
                }
            }
        }
    }
    inner.len() == outer.len()
}

/// Stream filter that covers a subject or pattern in the shared-stream model.
///
/// Event subjects are grouped per environment (`{env}.events.>`), topic subjects per
/// application (`{env}.{app}.>`). Anything with a wildcard in those leading
/// positions is used verbatim.
pub fn stream_filter_for(subject: &str) -> String {
    let tokens: Vec<&str> = subject.split(SEPARATOR).collect();
    match tokens.as_slice() {
        [env, EVENTS_TOKEN, _, ..] if is_literal(env) => format!("{env}.{EVENTS_TOKEN}.>"),
        [env, app, _, ..] if is_literal(env) && is_literal(app) => format!("{env}.{app}.>"),
        _ => subject.to_string(),
    }
}

fn is_literal(token: &str) -> bool {
    token != SINGLE_WILDCARD && token != TAIL_WILDCARD
}

/// Deterministic durable consumer name for an application and subject pattern.
///
/// Broker durable names may not contain `.`, `*` or `>`; the readable prefix is
/// sanitized and a short digest of the exact inputs keeps distinct patterns apart.
pub fn durable_name(app_name: &str, pattern: &str) -> String {
    let readable: String = format!("{}_{}", normalize(app_name), pattern)
        .chars()
        .map(|c| match c {
            '.' => '_',
            '*' => 'x',
            '>' => 'z',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(app_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(pattern.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}-{}", readable, &digest[..8])
}

#[cfg(test)]
mod tests;
