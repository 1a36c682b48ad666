//! Protocol-aware whitelist inspection.
//!
//! Each backend protocol family supplies a matcher: command/text protocols
//! ([`command`]) normalize the operation and test it against an ordered
//! allow-rule list, first match wins; request/response protocols ([`http`])
//! match method + path template. No match denies. Input that cannot be parsed
//! for the declared protocol also denies (fail-closed).
//!
//! Rules are compiled once per configuration generation, so identical
//! `(generation, operation)` pairs always yield the identical decision — the
//! filter holds no mutable state.

pub mod command;
pub mod http;

use regex::Regex;

use crate::config::{BackendKind, WhitelistRuleConfig};
use crate::{Error, Result};

/// Outcome of inspecting one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the operation.
    Allow,
    /// Forward only after an external approval.
    RequireApproval,
    /// Reject the operation.
    Deny {
        /// Why the operation was rejected.
        reason: String,
    },
}

impl Decision {
    /// Deny with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

/// A whitelist rule compiled for its protocol family.
#[derive(Debug)]
pub struct CompiledRule {
    /// Pattern as written in configuration (for audit detail).
    pub raw: String,
    /// Matches of this rule go through the approval gate.
    pub require_approval: bool,
    matcher: RuleMatcher,
}

#[derive(Debug)]
enum RuleMatcher {
    /// Whole normalized operation equals the normalized pattern.
    Exact(String),
    /// Normalized operation starts the pattern at a token boundary.
    Prefix(String),
    /// Regex over the normalized operation.
    Regex(Regex),
    /// HTTP method + path template.
    Route(http::RouteTemplate),
}

impl CompiledRule {
    /// Whether this rule matches an already-normalized command operation.
    fn matches_command(&self, normalized: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Exact(pattern) => normalized == pattern,
            RuleMatcher::Prefix(prefix) => {
                normalized == prefix
                    || normalized
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with(' '))
            }
            RuleMatcher::Regex(re) => re.is_match(normalized),
            RuleMatcher::Route(_) => false,
        }
    }

    /// Whether this rule matches a parsed HTTP request line.
    fn matches_request(&self, method: &str, path: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Route(template) => template.matches(method, path),
            // Regex rules test the whole request line
            RuleMatcher::Regex(re) => re.is_match(&format!("{method} {path}")),
            RuleMatcher::Exact(_) | RuleMatcher::Prefix(_) => false,
        }
    }
}

/// Compile the configured rule list for a backend protocol family.
///
/// # Errors
///
/// Returns [`Error::Config`] for an invalid regex or route template. Called
/// at generation build time, so a bad rule rejects the whole snapshot and the
/// previous generation stays active.
pub fn compile_rules(
    kind: BackendKind,
    rules: &[WhitelistRuleConfig],
) -> Result<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|rule| {
            let matcher = if let Some(expr) = rule.pattern.strip_prefix("regex:") {
                let re = Regex::new(expr).map_err(|e| {
                    Error::Config(format!("Invalid whitelist regex '{expr}': {e}"))
                })?;
                RuleMatcher::Regex(re)
            } else if kind.is_command_protocol() {
                if let Some(body) = rule.pattern.strip_suffix('*') {
                    RuleMatcher::Prefix(command::normalize(body))
                } else {
                    RuleMatcher::Exact(command::normalize(&rule.pattern))
                }
            } else {
                RuleMatcher::Route(http::RouteTemplate::parse(&rule.pattern)?)
            };

            Ok(CompiledRule {
                raw: rule.pattern.clone(),
                require_approval: rule.require_approval,
                matcher,
            })
        })
        .collect()
}

/// Inspect one raw operation against the compiled rule list.
///
/// First matching rule wins; no match denies; unparseable input denies.
#[must_use]
pub fn inspect(kind: BackendKind, rules: &[CompiledRule], raw: &[u8]) -> Decision {
    if kind.is_command_protocol() {
        command::inspect(rules, raw)
    } else {
        http::inspect(rules, raw)
    }
}
