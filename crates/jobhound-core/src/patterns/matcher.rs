use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use crate::messages::EmailMessage;

use super::types::{CompanyPattern, PatternRule, PatternSet, RuleField, RuleOperator};

/// Per-pass regex cache. Patterns that fail to compile are remembered as such
/// and reported once.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    regex_cache: HashMap<String, Option<Regex>>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn regex(&mut self, pattern: &str) -> Option<&Regex> {
        self.regex_cache
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(pattern, error = %err, "skipping malformed regex rule");
                    None
                }
            })
            .as_ref()
    }
}

/// Returns the first pattern in `set` order whose rules all hold for `message`.
///
/// Companies are tried by id ascending and, within a company, by priority; the
/// first hit wins. A rule with a malformed regex never holds.
pub fn match_message<'a>(
    message: &EmailMessage,
    set: &'a PatternSet,
    ctx: &mut EvaluationContext,
) -> Option<&'a CompanyPattern> {
    set.iter()
        .find(|pattern| pattern_matches(pattern, message, ctx))
}

pub fn pattern_matches(
    pattern: &CompanyPattern,
    message: &EmailMessage,
    ctx: &mut EvaluationContext,
) -> bool {
    !pattern.rules.is_empty()
        && pattern
            .rules
            .iter()
            .all(|rule| rule_matches(rule, message, ctx))
}

fn rule_matches(rule: &PatternRule, message: &EmailMessage, ctx: &mut EvaluationContext) -> bool {
    let candidates: Vec<&str> = match rule.field {
        RuleField::Sender => [message.from_email.as_deref(), message.from_name.as_deref()]
            .into_iter()
            .flatten()
            .collect(),
        RuleField::Subject => message.subject.as_deref().into_iter().collect(),
        RuleField::Body => message.body_text.as_deref().into_iter().collect(),
    };

    match rule.operator {
        RuleOperator::Exact => candidates
            .iter()
            .any(|candidate| exact_matches(rule.field, &rule.value, candidate)),
        RuleOperator::Contains => {
            let needle = rule.value.to_lowercase();
            candidates
                .iter()
                .any(|candidate| candidate.to_lowercase().contains(&needle))
        }
        RuleOperator::Regex => match ctx.regex(&rule.value) {
            Some(regex) => candidates.iter().any(|candidate| regex.is_match(candidate)),
            None => false,
        },
    }
}

fn exact_matches(field: RuleField, expected: &str, candidate: &str) -> bool {
    let expected = expected.trim();
    if field == RuleField::Sender {
        if let Some(domain) = expected.strip_prefix("*@") {
            return extract_domain(candidate)
                .is_some_and(|candidate_domain| candidate_domain.eq_ignore_ascii_case(domain));
        }
    }
    candidate.trim().to_lowercase() == expected.to_lowercase()
}

fn extract_domain(email: &str) -> Option<&str> {
    let at_index = email.rfind('@')?;
    let domain = &email[at_index + 1..];
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Allocation;
    use chrono::{TimeZone, Utc};

    fn message(subject: &str) -> EmailMessage {
        EmailMessage {
            id: "m1".into(),
            account_id: "acc".into(),
            remote_id: "r1".into(),
            from_email: Some("talent@Globex.io".into()),
            from_name: Some("Globex Talent".into()),
            subject: Some(subject.into()),
            body_text: Some("We would like to schedule a call next week.".into()),
            received_at: Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap(),
            attachments: vec![],
            allocation: Allocation::Unallocated,
            allocation_version: 0,
            classified_at: None,
            created_at: Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 1).unwrap(),
        }
    }

    fn pattern(id: &str, company: &str, priority: i64, rules: Vec<PatternRule>) -> CompanyPattern {
        CompanyPattern {
            id: id.into(),
            company_id: company.into(),
            priority,
            rules,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn rule(field: RuleField, operator: RuleOperator, value: &str) -> PatternRule {
        PatternRule::new(field, operator, value)
    }

    fn company_of(message: &EmailMessage, set: &PatternSet) -> Option<String> {
        let mut ctx = EvaluationContext::new();
        match_message(message, set, &mut ctx).map(|p| p.company_id.clone())
    }

    #[test]
    fn subject_contains_is_case_insensitive() {
        let set = PatternSet::new(vec![pattern(
            "p1",
            "acme",
            1,
            vec![rule(RuleField::Subject, RuleOperator::Contains, "interview")],
        )]);
        assert_eq!(
            company_of(&message("Your INTERVIEW slot"), &set).as_deref(),
            Some("acme")
        );
        assert_eq!(company_of(&message("Newsletter"), &set), None);
    }

    #[test]
    fn sender_exact_supports_domain_wildcard_and_display_name() {
        let by_domain = PatternSet::new(vec![pattern(
            "p1",
            "globex",
            1,
            vec![rule(RuleField::Sender, RuleOperator::Exact, "*@globex.IO")],
        )]);
        assert_eq!(
            company_of(&message("hi"), &by_domain).as_deref(),
            Some("globex")
        );

        let by_name = PatternSet::new(vec![pattern(
            "p1",
            "globex",
            1,
            vec![rule(RuleField::Sender, RuleOperator::Exact, "globex talent")],
        )]);
        assert_eq!(
            company_of(&message("hi"), &by_name).as_deref(),
            Some("globex")
        );
    }

    #[test]
    fn all_rules_of_a_pattern_must_hold() {
        let set = PatternSet::new(vec![pattern(
            "p1",
            "globex",
            1,
            vec![
                rule(RuleField::Sender, RuleOperator::Contains, "globex"),
                rule(RuleField::Body, RuleOperator::Contains, "offer letter"),
            ],
        )]);
        assert_eq!(company_of(&message("Call"), &set), None);
    }

    #[test]
    fn malformed_regex_does_not_block_other_patterns() {
        let set = PatternSet::new(vec![
            pattern(
                "broken",
                "a-first",
                1,
                vec![rule(RuleField::Subject, RuleOperator::Regex, "([unclosed")],
            ),
            pattern(
                "working",
                "b-second",
                1,
                vec![rule(RuleField::Subject, RuleOperator::Regex, r"(?i)^offer\b")],
            ),
        ]);
        assert_eq!(
            company_of(&message("Offer from Globex"), &set).as_deref(),
            Some("b-second")
        );
    }

    #[test]
    fn company_order_beats_pattern_priority_across_companies() {
        let set = PatternSet::new(vec![
            pattern(
                "late-company-urgent",
                "zeta",
                0,
                vec![rule(RuleField::Subject, RuleOperator::Contains, "offer")],
            ),
            pattern(
                "early-company-lax",
                "alpha",
                99,
                vec![rule(RuleField::Subject, RuleOperator::Contains, "offer")],
            ),
        ]);
        let mut ctx = EvaluationContext::new();
        let hit = match_message(&message("An offer"), &set, &mut ctx).expect("match");
        assert_eq!(hit.id, "early-company-lax");
    }

    #[test]
    fn priority_orders_patterns_within_a_company() {
        let set = PatternSet::new(vec![
            pattern(
                "generic",
                "acme",
                50,
                vec![rule(RuleField::Body, RuleOperator::Contains, "call")],
            ),
            pattern(
                "specific",
                "acme",
                10,
                vec![rule(RuleField::Body, RuleOperator::Regex, "schedule a call")],
            ),
        ]);
        let mut ctx = EvaluationContext::new();
        let hit = match_message(&message("x"), &set, &mut ctx).expect("match");
        assert_eq!(hit.id, "specific");
    }

    #[test]
    fn evaluation_is_deterministic_regardless_of_input_order() {
        let patterns = vec![
            pattern(
                "p-b",
                "b",
                1,
                vec![rule(RuleField::Subject, RuleOperator::Contains, "role")],
            ),
            pattern(
                "p-a",
                "a",
                2,
                vec![rule(RuleField::Subject, RuleOperator::Regex, "[Rr]ole")],
            ),
            pattern(
                "p-c",
                "c",
                0,
                vec![rule(RuleField::Subject, RuleOperator::Exact, "the role")],
            ),
        ];
        let mut reversed = patterns.clone();
        reversed.reverse();

        let forward = PatternSet::new(patterns);
        let backward = PatternSet::new(reversed);
        for subject in ["The role", "Role update", "nothing here"] {
            let msg = message(subject);
            let first = company_of(&msg, &forward);
            assert_eq!(first, company_of(&msg, &backward));
            assert_eq!(first, company_of(&msg, &forward));
        }
    }

    #[test]
    fn empty_pattern_never_matches() {
        let set = PatternSet::new(vec![pattern("empty", "acme", 1, vec![])]);
        assert_eq!(company_of(&message("anything"), &set), None);
    }
}
