//! Filter-expression DSL over version rows.
//!
//! A deliberately small, safe evaluator — not a general interpreter.  The
//! admitted grammar:
//!
//! ```text
//! expr    := or
//! or      := and ('or' and)*
//! and     := not ('and' not)*
//! not     := 'not' not | cmp
//! cmp     := primary ( ('==' | '!=' | '<' | '>' | '<=' | '>=' | 'like') primary )?
//! primary := 'True' | 'False' | INT | STR | IDENT | 'labels' '[' STR ']' | '(' expr ')'
//! ```
//!
//! Identifiers map to the static version schema; anything else is rejected
//! at parse time.  `labels[name]` as a bare expression is true iff the label
//! exists.  String literals compared against `date` are coerced to UTC,
//! accepting both absolute ISO timestamps and relative English ("1 week
//! ago").

use chrono::{DateTime, Utc};

pub mod dates;
pub mod eval;
pub mod lexer;
pub mod parser;

mod error;

pub use error::FilterError;
pub use parser::Expr;

use benji_common::Version;

/// A parsed, reusable filter expression.
#[derive(Debug, Clone)]
pub struct FilterExpr {
    expr: Expr,
}

impl FilterExpr {
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let tokens = lexer::tokenize(text)?;
        let expr = parser::Parser::new(tokens).parse()?;
        Ok(Self { expr })
    }

    /// Evaluate against a version with `now` pinned (relative dates).
    pub fn matches_at(&self, version: &Version, now: DateTime<Utc>) -> Result<bool, FilterError> {
        eval::evaluate(&self.expr, version, now)
    }

    pub fn matches(&self, version: &Version) -> Result<bool, FilterError> {
        self.matches_at(version, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    use benji_common::{VersionStatus, VersionUid};

    fn version() -> Version {
        Version {
            uid: VersionUid::new("V0000000007"),
            date: Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
            volume: "vm1".to_string(),
            snapshot: "daily-3".to_string(),
            size: 12 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,
            storage: "local".to_string(),
            status: VersionStatus::Valid,
            protected: false,
            labels: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("empty".to_string(), String::new()),
            ]),
            bytes_read: 100,
            bytes_written: 50,
            bytes_deduplicated: 25,
            bytes_sparse: 0,
            duration: 9,
        }
    }

    fn check(text: &str) -> bool {
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 12, 0, 0).unwrap();
        FilterExpr::parse(text).unwrap().matches_at(&version(), now).unwrap()
    }

    #[test]
    fn field_comparisons() {
        assert!(check("volume == 'vm1'"));
        assert!(check("volume != 'vm2'"));
        assert!(check("size > 1048576"));
        assert!(check("duration <= 9"));
        assert!(check("status == 'valid'"));
        assert!(check("uid == 'V0000000007'"));
        assert!(!check("protected"));
        assert!(check("not protected"));
    }

    #[test]
    fn boolean_connectives_and_precedence() {
        assert!(check("volume == 'vm1' and size > 0"));
        assert!(check("volume == 'vm2' or size > 0"));
        // `and` binds tighter than `or`.
        assert!(check("volume == 'vm2' and protected or status == 'valid'"));
        assert!(check("not (volume == 'vm2' and protected)"));
        assert!(check("True"));
        assert!(!check("False"));
    }

    #[test]
    fn label_access_and_existence() {
        assert!(check("labels['env'] == 'prod'"));
        assert!(check("labels['env'] != 'dev'"));
        assert!(check("labels['env']"));
        // Existing label with empty value still exists.
        assert!(check("labels['empty']"));
        assert!(!check("labels['missing']"));
    }

    #[test]
    fn like_wildcards() {
        assert!(check("snapshot like 'daily-%'"));
        assert!(check("snapshot like 'daily-_'"));
        assert!(!check("snapshot like 'weekly-%'"));
        assert!(check("volume like 'vm%'"));
    }

    #[test]
    fn date_coercion_absolute_and_relative() {
        assert!(check("date < '2024-04-01'"));
        assert!(check("date > '2024-01-01T00:00:00Z'"));
        // `now` is pinned to 2024-03-17; the version is 7 days old.
        assert!(check("date <= '1 week ago'"));
        assert!(!check("date > '2 days ago'"));
    }

    #[test]
    fn rejects_unknown_identifiers_and_syntax() {
        assert!(FilterExpr::parse("password == 'x'").is_err());
        assert!(FilterExpr::parse("volume.__class__").is_err());
        assert!(FilterExpr::parse("volume == ").is_err());
        assert!(FilterExpr::parse("volume ==== 'x'").is_err());
        assert!(FilterExpr::parse("f(1)").is_err());
        assert!(FilterExpr::parse("labels[env]").is_err());
        assert!(FilterExpr::parse("").is_err());
    }

    #[test]
    fn type_mismatches_are_evaluation_errors() {
        let now = Utc::now();
        let filter = FilterExpr::parse("volume > 3").unwrap();
        assert!(filter.matches_at(&version(), now).is_err());
        let filter = FilterExpr::parse("size like '%'").unwrap();
        assert!(filter.matches_at(&version(), now).is_err());
    }
}
