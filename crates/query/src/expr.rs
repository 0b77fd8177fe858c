//! Filter-document parser.
//!
//! Turns an untrusted, canonicalized JSON filter into a closed expression
//! tree. Every `$`-prefixed keyword outside the allow-list fails the whole
//! document; parsing never executes or concatenates client text.

use serde_json::Value;

use crate::TranslateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    True,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Scalar,
    },
    /// Whole-value equality against a JSON object or array.
    EqJson {
        path: FieldPath,
        value: Value,
    },
    In {
        path: FieldPath,
        values: Vec<Scalar>,
        negated: bool,
    },
    Regex {
        path: FieldPath,
        pattern: String,
        case_insensitive: bool,
    },
    Contains {
        path: FieldPath,
        value: Value,
    },
    Near {
        path: FieldPath,
        geometry: Value,
        min_meters: f64,
        max_meters: Option<f64>,
    },
    Within {
        path: FieldPath,
        geometry: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl Scalar {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => Some(Scalar::Number(n.clone())),
            Value::String(s) => Some(Scalar::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

/// Dot-separated field path into the record document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    fn parse(field: &str) -> Result<Self, TranslateError> {
        let segments = field
            .split('.')
            .map(str::to_string)
            .collect::<Vec<String>>();
        for segment in &segments {
            if segment.is_empty() {
                return Err(TranslateError::shape(format!(
                    "field path `{}` has an empty segment",
                    field
                )));
            }
            if segment.bytes().any(|b| b == 0) {
                return Err(TranslateError::shape(format!(
                    "field path `{}` contains a NUL byte",
                    field
                )));
            }
        }
        Ok(FieldPath(segments))
    }
}

pub fn parse_document(doc: &Value) -> Result<Expr, TranslateError> {
    let Some(map) = doc.as_object() else {
        return Err(TranslateError::shape("filter document must be a JSON object"));
    };

    let mut terms = Vec::with_capacity(map.len());
    for (key, value) in map {
        terms.push(parse_entry(key, value)?);
    }

    Ok(match terms.len() {
        0 => Expr::True,
        1 => terms.into_iter().next().expect("one term"),
        _ => Expr::And(terms),
    })
}

fn parse_entry(key: &str, value: &Value) -> Result<Expr, TranslateError> {
    match key {
        "$and" => Ok(Expr::And(parse_clause_list(key, value)?)),
        "$or" => Ok(Expr::Or(parse_clause_list(key, value)?)),
        "$nor" => Ok(Expr::Nor(parse_clause_list(key, value)?)),
        "$not" => Ok(Expr::Not(Box::new(parse_document(value)?))),
        _ if key.starts_with('$') => Err(TranslateError::unknown_operator(key)),
        field => parse_field(field, value),
    }
}

fn parse_clause_list(op: &str, value: &Value) -> Result<Vec<Expr>, TranslateError> {
    let Some(items) = value.as_array() else {
        return Err(TranslateError::shape(format!(
            "`{}` requires an array of filter documents",
            op
        )));
    };
    if items.is_empty() {
        return Err(TranslateError::shape(format!(
            "`{}` requires at least one clause",
            op
        )));
    }
    items.iter().map(parse_document).collect()
}

fn parse_field(field: &str, value: &Value) -> Result<Expr, TranslateError> {
    let path = FieldPath::parse(field)?;

    match value {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            parse_operator_doc(&path, map)
        }
        Value::Object(_) | Value::Array(_) => Ok(Expr::EqJson {
            path,
            value: value.clone(),
        }),
        scalar => {
            let value = Scalar::from_value(scalar).expect("non-composite JSON value");
            Ok(Expr::Compare {
                path,
                op: CompareOp::Eq,
                value,
            })
        }
    }
}

fn parse_operator_doc(
    path: &FieldPath,
    map: &serde_json::Map<String, Value>,
) -> Result<Expr, TranslateError> {
    let mut terms = Vec::with_capacity(map.len());
    let case_insensitive = regex_options(map)?;

    for (op, value) in map {
        let term = match op.as_str() {
            "$eq" => compare(path, CompareOp::Eq, value)?,
            "$ne" => compare(path, CompareOp::Ne, value)?,
            "$lt" => compare(path, CompareOp::Lt, value)?,
            "$lte" => compare(path, CompareOp::Lte, value)?,
            "$gt" => compare(path, CompareOp::Gt, value)?,
            "$gte" => compare(path, CompareOp::Gte, value)?,
            "$in" => in_list(path, value, false)?,
            "$nin" => in_list(path, value, true)?,
            "$regex" => {
                let Some(pattern) = value.as_str() else {
                    return Err(TranslateError::shape("`$regex` requires a string pattern"));
                };
                Expr::Regex {
                    path: path.clone(),
                    pattern: pattern.to_string(),
                    case_insensitive,
                }
            }
            // Consumed together with $regex above.
            "$options" => continue,
            "$contains" => Expr::Contains {
                path: path.clone(),
                value: value.clone(),
            },
            "$near" => parse_near(path, value)?,
            "$within" => Expr::Within {
                path: path.clone(),
                geometry: parse_geometry_doc(value, "$within")?,
            },
            "$not" => Expr::Not(Box::new(parse_field_condition(path, value)?)),
            other if other.starts_with('$') => {
                return Err(TranslateError::unknown_operator(other));
            }
            other => {
                return Err(TranslateError::shape(format!(
                    "field `{}` mixes operators with plain key `{}`",
                    path.0.join("."),
                    other
                )));
            }
        };
        terms.push(term);
    }

    Ok(match terms.len() {
        0 => Expr::True,
        1 => terms.into_iter().next().expect("one term"),
        _ => Expr::And(terms),
    })
}

/// `{"field": {"$not": ...}}` accepts either an operator sub-document or a
/// plain value (negated equality).
fn parse_field_condition(path: &FieldPath, value: &Value) -> Result<Expr, TranslateError> {
    parse_field(&path.0.join("."), value)
}

fn regex_options(map: &serde_json::Map<String, Value>) -> Result<bool, TranslateError> {
    let Some(options) = map.get("$options") else {
        return Ok(false);
    };
    if !map.contains_key("$regex") {
        return Err(TranslateError::shape(
            "`$options` is only valid alongside `$regex`",
        ));
    }
    let Some(options) = options.as_str() else {
        return Err(TranslateError::shape("`$options` requires a string"));
    };
    match options {
        "" => Ok(false),
        "i" => Ok(true),
        other => Err(TranslateError::shape(format!(
            "unsupported `$options` flags `{}` (only `i` is supported)",
            other
        ))),
    }
}

fn compare(path: &FieldPath, op: CompareOp, value: &Value) -> Result<Expr, TranslateError> {
    match Scalar::from_value(value) {
        Some(scalar) => {
            if matches!(scalar, Scalar::Null)
                && !matches!(op, CompareOp::Eq | CompareOp::Ne)
            {
                return Err(TranslateError::shape(
                    "null is only comparable with `$eq`/`$ne`",
                ));
            }
            if matches!(scalar, Scalar::Bool(_))
                && !matches!(op, CompareOp::Eq | CompareOp::Ne)
            {
                return Err(TranslateError::shape(
                    "booleans are only comparable with `$eq`/`$ne`",
                ));
            }
            Ok(Expr::Compare {
                path: path.clone(),
                op,
                value: scalar,
            })
        }
        None if matches!(op, CompareOp::Eq) => Ok(Expr::EqJson {
            path: path.clone(),
            value: value.clone(),
        }),
        None if matches!(op, CompareOp::Ne) => Ok(Expr::Not(Box::new(Expr::EqJson {
            path: path.clone(),
            value: value.clone(),
        }))),
        None => Err(TranslateError::shape(
            "ordering comparisons require a scalar operand",
        )),
    }
}

fn in_list(path: &FieldPath, value: &Value, negated: bool) -> Result<Expr, TranslateError> {
    let op = if negated { "$nin" } else { "$in" };
    let Some(items) = value.as_array() else {
        return Err(TranslateError::shape(format!(
            "`{}` requires an array of scalar values",
            op
        )));
    };

    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let Some(scalar) = Scalar::from_value(item) else {
            return Err(TranslateError::shape(format!(
                "`{}` elements must be scalar values",
                op
            )));
        };
        values.push(scalar);
    }

    Ok(Expr::In {
        path: path.clone(),
        values,
        negated,
    })
}

fn parse_near(path: &FieldPath, value: &Value) -> Result<Expr, TranslateError> {
    let Some(map) = value.as_object() else {
        return Err(TranslateError::shape(
            "`$near` requires an object with `$geometry`",
        ));
    };

    let mut geometry = None;
    let mut min_meters = 0.0_f64;
    let mut max_meters = None;

    for (key, item) in map {
        match key.as_str() {
            "$geometry" => geometry = Some(parse_geometry_doc(item, "$near")?),
            "$min" => min_meters = distance_bound(item, "$min")?,
            "$max" => max_meters = Some(distance_bound(item, "$max")?),
            other if other.starts_with('$') => {
                return Err(TranslateError::unknown_operator(other));
            }
            other => {
                return Err(TranslateError::shape(format!(
                    "unexpected `$near` key `{}`",
                    other
                )));
            }
        }
    }

    let Some(geometry) = geometry else {
        return Err(TranslateError::shape("`$near` requires `$geometry`"));
    };
    if let Some(max) = max_meters {
        if max < min_meters {
            return Err(TranslateError::shape(
                "`$near` `$max` must be greater than or equal to `$min`",
            ));
        }
    }

    Ok(Expr::Near {
        path: path.clone(),
        geometry,
        min_meters,
        max_meters,
    })
}

fn distance_bound(value: &Value, key: &str) -> Result<f64, TranslateError> {
    let Some(n) = value.as_f64() else {
        return Err(TranslateError::shape(format!(
            "`{}` requires a number of meters",
            key
        )));
    };
    if !n.is_finite() || n < 0.0 {
        return Err(TranslateError::shape(format!(
            "`{}` must be a finite, non-negative number",
            key
        )));
    }
    Ok(n)
}

/// Validates GeoJSON shape without interpreting it; coordinates are checked
/// for numeric content and `$`-prefixed keys are refused outright.
fn parse_geometry_doc(value: &Value, op: &str) -> Result<Value, TranslateError> {
    let geometry = match value.as_object() {
        Some(map) if map.contains_key("$geometry") && op == "$within" => {
            // $within accepts either the bare geometry or {"$geometry": ...}.
            for key in map.keys() {
                if key != "$geometry" {
                    return Err(TranslateError::shape(format!(
                        "unexpected `{}` key `{}`",
                        op, key
                    )));
                }
            }
            &map["$geometry"]
        }
        _ => value,
    };

    let Some(map) = geometry.as_object() else {
        return Err(TranslateError::shape(format!(
            "`{}` geometry must be a GeoJSON object",
            op
        )));
    };

    if !map
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.is_empty())
    {
        return Err(TranslateError::shape(format!(
            "`{}` geometry requires a GeoJSON `type`",
            op
        )));
    }
    if !map.get("coordinates").is_some_and(Value::is_array) {
        return Err(TranslateError::shape(format!(
            "`{}` geometry requires `coordinates`",
            op
        )));
    }
    if has_dollar_key(geometry) {
        return Err(TranslateError::shape(format!(
            "`{}` geometry must not contain operator keys",
            op
        )));
    }

    Ok(geometry.clone())
}

fn has_dollar_key(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.starts_with('$') || has_dollar_key(v)),
        Value::Array(items) => items.iter().any(has_dollar_key),
        _ => false,
    }
}
