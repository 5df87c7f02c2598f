use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    /// Sender address or display name.
    Sender,
    Subject,
    /// Plain-text body.
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    /// Whole-value, case-insensitive. For `sender`, `*@domain` matches the domain.
    Exact,
    /// Case-insensitive substring.
    Contains,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: String,
}

impl PatternRule {
    pub fn new(field: RuleField, operator: RuleOperator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
        }
    }

    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.value.trim().is_empty() {
            return Err(RuleValidationError::EmptyValue);
        }
        if self.operator == RuleOperator::Regex {
            Regex::new(&self.value).map_err(|source| RuleValidationError::InvalidRegex {
                pattern: self.value.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RuleValidationError {
    #[error("pattern needs at least one rule")]
    NoRules,
    #[error("rule value must not be empty")]
    EmptyValue,
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

/// Ordered rule list owned by one company. Matches when every rule holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyPattern {
    pub id: String,
    pub company_id: String,
    /// Lower runs first within the company.
    pub priority: i64,
    pub rules: Vec<PatternRule>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewCompanyPattern {
    #[serde(default = "default_priority")]
    pub priority: i64,
    pub rules: Vec<PatternRule>,
}

fn default_priority() -> i64 {
    100
}

impl NewCompanyPattern {
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.rules.is_empty() {
            return Err(RuleValidationError::NoRules);
        }
        self.rules.iter().try_for_each(PatternRule::validate)
    }
}

/// Every pattern of every company in evaluation order: company id ascending,
/// then priority ascending, then creation time, then pattern id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<CompanyPattern>,
}

impl PatternSet {
    pub fn new(mut patterns: Vec<CompanyPattern>) -> Self {
        patterns.sort_by(|a, b| {
            a.company_id
                .cmp(&b.company_id)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Self { patterns }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompanyPattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
