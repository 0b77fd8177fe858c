//! Query translator: compiles untrusted filter documents into safe catalog
//! predicates.
//!
//! The grammar is a constrained comparison language (implicit equality,
//! `$eq`/`$ne`/`$lt`/`$lte`/`$gt`/`$gte`, `$in`/`$nin`, `$regex`+`$options`,
//! `$contains`, `$near`/`$within`, and `$and`/`$or`/`$not`/`$nor`). The
//! operator set is a closed allow-list: anything else invalidates the whole
//! document. Documents are canonicalized (recursive key sort) before
//! compilation so equivalent inputs emit identical fragments.
//!
//! Translation never fails loudly: malformed input yields an always-false
//! predicate with `valid == false` and a cause, so callers can distinguish
//! "valid but zero-match" from "malformed input".

use tributary_contracts::canonical;

mod expr;
mod sql;

pub use expr::{CompareOp, Expr, FieldPath, Scalar};

/// Predicate used when a document cannot be compiled.
pub const ALWAYS_FALSE: &str = "FALSE";

/// Predicate used for an absent or empty filter.
pub const ALWAYS_TRUE: &str = "TRUE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// The input was not valid JSON at all.
    InvalidJson(String),
    /// A `$`-keyword outside the allow-list appeared somewhere in the tree.
    UnknownOperator(String),
    /// Syntactically allowed but does not compile into a predicate.
    Shape(String),
}

impl TranslateError {
    pub(crate) fn unknown_operator(op: impl Into<String>) -> Self {
        TranslateError::UnknownOperator(op.into())
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        TranslateError::Shape(message.into())
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::InvalidJson(detail) => {
                write!(f, "filter is not valid JSON: {}", detail)
            }
            TranslateError::UnknownOperator(op) => {
                write!(f, "filter operator `{}` is not allowed", op)
            }
            TranslateError::Shape(detail) => {
                write!(f, "filter does not compile: {}", detail)
            }
        }
    }
}

impl std::error::Error for TranslateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Self-contained boolean SQL fragment over the `document` column.
    pub sql: String,
    pub valid: bool,
    pub error: Option<TranslateError>,
}

impl Translation {
    fn ok(sql: String) -> Self {
        Self {
            sql,
            valid: true,
            error: None,
        }
    }

    fn invalid(error: TranslateError) -> Self {
        Self {
            sql: ALWAYS_FALSE.to_string(),
            valid: false,
            error: Some(error),
        }
    }
}

/// Translates raw client text. Invalid JSON is one of the three
/// distinguished failure causes.
pub fn translate(raw: &str) -> Translation {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => translate_value(&value),
        Err(err) => Translation::invalid(TranslateError::InvalidJson(err.to_string())),
    }
}

/// Translates an already parsed document (e.g. a policy segment query).
pub fn translate_value(doc: &serde_json::Value) -> Translation {
    let canonicalized = canonical::canonicalize_json_value(doc);
    let parsed = match expr::parse_document(&canonicalized) {
        Ok(parsed) => parsed,
        Err(err) => return Translation::invalid(err),
    };
    match sql::emit(&parsed) {
        Ok(sql) => Translation::ok(sql),
        Err(err) => Translation::invalid(err),
    }
}

/// ANDs two already-compiled fragments (e.g. client filter and policy scope).
pub fn conjoin(a: &str, b: &str) -> String {
    match (a, b) {
        (ALWAYS_TRUE, other) | (other, ALWAYS_TRUE) => other.to_string(),
        _ => format!("({}) AND ({})", a, b),
    }
}
