//! Whitelist matching for request/response (HTTP) backends.
//!
//! Rules are `METHOD /path/template` strings. A `{name}` segment matches any
//! single path segment; a final `*` segment matches any remainder. The
//! operation payload is an HTTP request whose request line supplies the
//! method and path; anything that does not parse as a request line denies.

use super::{CompiledRule, Decision};
use crate::{Error, Result};

/// A compiled `METHOD /path/{param}` template.
#[derive(Debug)]
pub struct RouteTemplate {
    method: String,
    segments: Vec<Segment>,
}

#[derive(Debug)]
enum Segment {
    /// Literal path segment, compared case-sensitively.
    Literal(String),
    /// `{name}` — any single segment.
    Param,
    /// Trailing `*` — any remainder, including none.
    Wildcard,
}

impl RouteTemplate {
    /// Parse a `METHOD /path/template` pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing method, a path without a
    /// leading slash, or a `*` that is not the final segment.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut parts = pattern.split_whitespace();
        let (Some(method), Some(path), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Config(format!(
                "Route pattern must be 'METHOD /path': {pattern}"
            )));
        };
        if !path.starts_with('/') {
            return Err(Error::Config(format!(
                "Route path must start with '/': {pattern}"
            )));
        }

        let raw_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let mut segments = Vec::with_capacity(raw_segments.len());
        for (i, seg) in raw_segments.iter().enumerate() {
            if *seg == "*" {
                if i + 1 != raw_segments.len() {
                    return Err(Error::Config(format!(
                        "'*' must be the final segment: {pattern}"
                    )));
                }
                segments.push(Segment::Wildcard);
            } else if seg.starts_with('{') && seg.ends_with('}') {
                segments.push(Segment::Param);
            } else {
                segments.push(Segment::Literal((*seg).to_string()));
            }
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            segments,
        })
    }

    /// Whether a parsed request line matches this template.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if !method.eq_ignore_ascii_case(&self.method) {
            return false;
        }

        let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let mut pi = 0;
        for seg in &self.segments {
            match seg {
                Segment::Wildcard => return true,
                Segment::Param => {
                    // A param consumes exactly one non-empty segment
                    if path_segments.get(pi).is_none_or(|s| s.is_empty()) {
                        return false;
                    }
                    pi += 1;
                }
                Segment::Literal(lit) => {
                    if path_segments.get(pi) != Some(&lit.as_str()) {
                        return false;
                    }
                    pi += 1;
                }
            }
        }

        pi == path_segments.len()
            || (pi == path_segments.len() - 1 && path_segments[pi].is_empty())
    }
}

/// Parse the request line out of a raw HTTP operation payload.
///
/// Returns `(method, path)` with any query string removed.
fn parse_request_line(raw: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(raw).ok()?;
    let line = text.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if !target.starts_with('/') {
        return None;
    }
    let path = target.split('?').next().unwrap_or(target);
    Some((method.to_ascii_uppercase(), path.to_string()))
}

/// Inspect one raw HTTP operation.
#[must_use]
pub fn inspect(rules: &[CompiledRule], raw: &[u8]) -> Decision {
    let Some((method, path)) = parse_request_line(raw) else {
        return Decision::deny("operation is not a valid HTTP request line");
    };

    for rule in rules {
        if rule.matches_request(&method, &path) {
            return if rule.require_approval {
                Decision::RequireApproval
            } else {
                Decision::Allow
            };
        }
    }

    Decision::deny(format!("no whitelist rule matched: {method} {path}"))
}
