pub mod matcher;
pub mod repository;
pub mod types;

pub use matcher::{EvaluationContext, match_message, pattern_matches};
pub use repository::{PatternError, PatternRepository};
pub use types::{
    CompanyPattern, NewCompanyPattern, PatternRule, PatternSet, RuleField, RuleOperator,
    RuleValidationError,
};
