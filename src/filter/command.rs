//! Whitelist matching for command/text protocols (SQL, Redis commands).
//!
//! Operations are normalized before matching: lower-cased, whitespace
//! collapsed to single spaces, trimmed, trailing statement terminator
//! stripped. Patterns are normalized the same way at compile time, so
//! matching is a plain string comparison.

use super::{CompiledRule, Decision};

/// Normalize command text for matching.
///
/// Lower-case, collapse all whitespace runs to one space, trim, and drop a
/// trailing `;`.
#[must_use]
pub fn normalize(text: &str) -> String {
    let collapsed = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.trim_end_matches(';').trim_end().to_string()
}

/// Inspect one raw command operation.
///
/// Non-UTF-8 payloads and operations that normalize to nothing are
/// unparseable for a text protocol and deny (fail-closed).
#[must_use]
pub fn inspect(rules: &[CompiledRule], raw: &[u8]) -> Decision {
    let Ok(text) = std::str::from_utf8(raw) else {
        return Decision::deny("operation is not valid UTF-8 for a text protocol");
    };

    let normalized = normalize(text);
    if normalized.is_empty() {
        return Decision::deny("empty operation");
    }

    for rule in rules {
        if rule.matches_command(&normalized) {
            return if rule.require_approval {
                Decision::RequireApproval
            } else {
                Decision::Allow
            };
        }
    }

    Decision::deny(format!("no whitelist rule matched: {normalized}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, WhitelistRuleConfig};
    use crate::filter::compile_rules;

    fn compile(patterns: &[&str]) -> Vec<CompiledRule> {
        let configs: Vec<WhitelistRuleConfig> = patterns
            .iter()
            .map(|p| WhitelistRuleConfig {
                pattern: (*p).to_string(),
                require_approval: false,
            })
            .collect();
        compile_rules(BackendKind::Postgres, &configs).unwrap()
    }

    #[test]
    fn normalize_folds_case_and_whitespace() {
        assert_eq!(normalize("  SELECT   1  "), "select 1");
        assert_eq!(normalize("Select\n *\tFROM users;"), "select * from users");
        assert_eq!(normalize("PING"), "ping");
    }

    #[test]
    fn exact_rule_matches_normalized_text() {
        // GIVEN: an exact rule
        let rules = compile(&["SELECT 1"]);

        // THEN: case and spacing variants all match
        assert_eq!(inspect(&rules, b"select 1"), Decision::Allow);
        assert_eq!(inspect(&rules, b"SELECT   1;"), Decision::Allow);
        assert!(matches!(
            inspect(&rules, b"select 2"),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn prefix_rule_matches_at_token_boundary() {
        // GIVEN: a trailing-* prefix rule
        let rules = compile(&["select *"]);

        // THEN: full statements starting with the token match
        assert_eq!(inspect(&rules, b"SELECT id FROM users"), Decision::Allow);
        assert_eq!(inspect(&rules, b"select"), Decision::Allow);
        // but a longer first token does not
        assert!(matches!(
            inspect(&rules, b"selections from t"),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn regex_rule_matches_normalized_text() {
        let rules = compile(&[r"regex:^select [a-z_]+ from audit_log\b"]);
        assert_eq!(
            inspect(&rules, b"SELECT entry FROM audit_log LIMIT 10"),
            Decision::Allow
        );
        assert!(matches!(
            inspect(&rules, b"SELECT entry FROM secrets"),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn non_utf8_payload_denies() {
        let rules = compile(&["select *"]);
        assert!(matches!(
            inspect(&rules, &[0xff, 0xfe, 0x00]),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn blank_payload_denies() {
        let rules = compile(&["select *"]);
        assert!(matches!(inspect(&rules, b"   \n  "), Decision::Deny { .. }));
        assert!(matches!(inspect(&rules, b";"), Decision::Deny { .. }));
    }
}
