//! Evaluator mapping the AST onto a version row.

use chrono::{DateTime, Utc};

use benji_common::Version;

use crate::dates::parse_date;
use crate::parser::{CmpOp, Expr, Field};
use crate::FilterError;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    Date(DateTime<Utc>),
    /// Missing label.
    Absent,
}

pub fn evaluate(expr: &Expr, version: &Version, now: DateTime<Utc>) -> Result<bool, FilterError> {
    truthy(&eval(expr, version, now)?)
}

fn eval(expr: &Expr, version: &Version, now: DateTime<Utc>) -> Result<Value, FilterError> {
    match expr {
        Expr::Bool(value) => Ok(Value::Bool(*value)),
        Expr::Int(value) => Ok(Value::Int(*value)),
        Expr::Str(value) => Ok(Value::Str(value.clone())),
        Expr::Field(field) => Ok(field_value(*field, version)),
        Expr::Label(name) => Ok(version
            .labels
            .get(name)
            .map(|value| Value::Str(value.clone()))
            .unwrap_or(Value::Absent)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, version, now)?)?)),
        Expr::And(left, right) => {
            if !truthy(&eval(left, version, now)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(right, version, now)?)?))
        }
        Expr::Or(left, right) => {
            if truthy(&eval(left, version, now)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(right, version, now)?)?))
        }
        Expr::Cmp(op, left, right) => {
            let left = eval(left, version, now)?;
            let right = eval(right, version, now)?;
            compare(*op, left, right, now).map(Value::Bool)
        }
    }
}

fn field_value(field: Field, version: &Version) -> Value {
    match field {
        Field::Uid => Value::Str(version.uid.as_str().to_string()),
        Field::Date => Value::Date(version.date),
        Field::Volume => Value::Str(version.volume.clone()),
        Field::Snapshot => Value::Str(version.snapshot.clone()),
        Field::Size => Value::Int(version.size as i64),
        Field::BlockSize => Value::Int(version.block_size as i64),
        Field::Storage => Value::Str(version.storage.clone()),
        Field::Status => Value::Str(version.status.as_str().to_string()),
        Field::Protected => Value::Bool(version.protected),
        Field::BytesRead => Value::Int(version.bytes_read as i64),
        Field::BytesWritten => Value::Int(version.bytes_written as i64),
        Field::BytesDeduplicated => Value::Int(version.bytes_deduplicated as i64),
        Field::BytesSparse => Value::Int(version.bytes_sparse as i64),
        Field::Duration => Value::Int(version.duration as i64),
    }
}

fn truthy(value: &Value) -> Result<bool, FilterError> {
    match value {
        Value::Bool(value) => Ok(*value),
        // A bare labels['x'] tests existence.
        Value::Absent => Ok(false),
        Value::Str(_) => Ok(true),
        other => Err(FilterError::type_error(format!(
            "{other:?} is not a boolean"
        ))),
    }
}

fn compare(op: CmpOp, left: Value, right: Value, now: DateTime<Utc>) -> Result<bool, FilterError> {
    // Comparisons against `date` coerce the other side from a string.
    let (left, right) = coerce_dates(left, right, now)?;

    if op == CmpOp::Like {
        return match (&left, &right) {
            (Value::Str(text), Value::Str(pattern)) => Ok(like_match(text, pattern)),
            _ => Err(FilterError::type_error(
                "like requires string operands".to_string(),
            )),
        };
    }

    let ordering = match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Date(a), Value::Date(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => return Ok(a == b),
            CmpOp::Ne => return Ok(a != b),
            _ => {
                return Err(FilterError::type_error(
                    "booleans only support == and !=".to_string(),
                ))
            }
        },
        // Comparing a label against anything when the label is missing:
        // equality is false, inequality true.
        (Value::Absent, _) | (_, Value::Absent) => {
            return match op {
                CmpOp::Eq => Ok(false),
                CmpOp::Ne => Ok(true),
                _ => Err(FilterError::type_error(
                    "missing label only supports == and !=".to_string(),
                )),
            };
        }
        (a, b) => {
            return Err(FilterError::type_error(format!(
                "cannot compare {a:?} with {b:?}"
            )))
        }
    };

    Ok(match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => !ordering.is_eq(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Ge => ordering.is_ge(),
        CmpOp::Like => unreachable!("handled above"),
    })
}

fn coerce_dates(
    left: Value,
    right: Value,
    now: DateTime<Utc>,
) -> Result<(Value, Value), FilterError> {
    match (&left, &right) {
        (Value::Date(_), Value::Str(text)) => {
            let date = parse_date(text, now).ok_or_else(|| FilterError::BadDate {
                text: text.clone(),
            })?;
            Ok((left, Value::Date(date)))
        }
        (Value::Str(text), Value::Date(_)) => {
            let date = parse_date(text, now).ok_or_else(|| FilterError::BadDate {
                text: text.clone(),
            })?;
            Ok((Value::Date(date), right))
        }
        _ => Ok((left, right)),
    }
}

/// SQL-style `like`: `%` matches any run, `_` any single character,
/// backslash escapes.  Case-sensitive.
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_rec(&text, &pattern)
}

fn like_rec(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => {
            (0..=text.len()).any(|skip| like_rec(&text[skip..], rest))
        }
        Some(('_', rest)) => !text.is_empty() && like_rec(&text[1..], rest),
        Some(('\\', rest)) => match rest.split_first() {
            Some((escaped, rest)) => {
                text.first() == Some(escaped) && like_rec(&text[1..], rest)
            }
            None => false,
        },
        Some((literal, rest)) => {
            text.first() == Some(literal) && like_rec(&text[1..], rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_semantics() {
        assert!(like_match("daily-1", "daily-%"));
        assert!(like_match("daily-1", "%-1"));
        assert!(like_match("daily-1", "daily-_"));
        assert!(!like_match("daily-12", "daily-_"));
        assert!(like_match("", "%"));
        assert!(like_match("100%", "100\\%"));
        assert!(!like_match("100x", "100\\%"));
        assert!(like_match("a_b", "a\\_b"));
        assert!(!like_match("axb", "a\\_b"));
        assert!(!like_match("Daily", "daily"));
    }
}
