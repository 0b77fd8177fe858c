//! Predicate emission.
//!
//! Walks the expression tree and emits one Postgres boolean fragment per
//! node over the catalog `document` JSONB column. String literals are quoted
//! for SQL and path segments for the JSONB path-literal language; no client
//! text is ever embedded unescaped, and no fragment is patched after
//! serialization.

use serde_json::Value;

use tributary_contracts::canonical;

use crate::expr::{CompareOp, Expr, FieldPath, Scalar};
use crate::TranslateError;

pub fn emit(expr: &Expr) -> Result<String, TranslateError> {
    Ok(match expr {
        Expr::True => "TRUE".to_string(),
        Expr::And(terms) => join(terms, " AND ")?,
        Expr::Or(terms) => join(terms, " OR ")?,
        // Missing fields make the inner predicate NULL; the negation must
        // still match such rows, like `$ne`/`$nin` do.
        Expr::Nor(terms) => format!("NOT COALESCE({}, FALSE)", join(terms, " OR ")?),
        Expr::Not(inner) => format!("NOT COALESCE(({}), FALSE)", emit(inner)?),
        Expr::Compare { path, op, value } => emit_compare(path, *op, value)?,
        Expr::EqJson { path, value } => format!(
            "({} = {}::jsonb)",
            path_jsonb(path)?,
            quote_literal(&canonical::canonical_json_string(value))?
        ),
        Expr::In {
            path,
            values,
            negated,
        } => emit_in(path, values, *negated)?,
        Expr::Regex {
            path,
            pattern,
            case_insensitive,
        } => format!(
            "({} {} {})",
            path_text(path)?,
            if *case_insensitive { "~*" } else { "~" },
            quote_literal(pattern)?
        ),
        Expr::Contains { path, value } => {
            let needle = Value::Array(vec![value.clone()]);
            format!(
                "(jsonb_typeof({}) = 'array' AND {} @> {}::jsonb)",
                path_jsonb(path)?,
                path_jsonb(path)?,
                quote_literal(&canonical::canonical_json_string(&needle))?
            )
        }
        Expr::Near {
            path,
            geometry,
            min_meters,
            max_meters,
        } => emit_near(path, geometry, *min_meters, *max_meters)?,
        Expr::Within { path, geometry } => format!(
            "ST_Covers({}, {})",
            geometry_literal(geometry)?,
            field_geography(path)?
        ),
    })
}

fn join(terms: &[Expr], sep: &str) -> Result<String, TranslateError> {
    let parts = terms.iter().map(emit).collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", parts.join(sep)))
}

fn emit_compare(path: &FieldPath, op: CompareOp, value: &Scalar) -> Result<String, TranslateError> {
    match value {
        Scalar::Null => {
            // Equality with null matches both JSON null and a missing field.
            let test = format!(
                "({jp} IS NULL OR {jp} = 'null'::jsonb)",
                jp = path_jsonb(path)?
            );
            Ok(match op {
                CompareOp::Eq => test,
                CompareOp::Ne => format!("NOT {}", test),
                _ => {
                    return Err(TranslateError::shape(
                        "null is only comparable with `$eq`/`$ne`",
                    ))
                }
            })
        }
        Scalar::Bool(b) => {
            let lit = if *b { "'true'::jsonb" } else { "'false'::jsonb" };
            Ok(match op {
                CompareOp::Eq => format!("({} = {})", path_jsonb(path)?, lit),
                CompareOp::Ne => format!(
                    "COALESCE({} <> {}, TRUE)",
                    path_jsonb(path)?,
                    lit
                ),
                _ => {
                    return Err(TranslateError::shape(
                        "booleans are only comparable with `$eq`/`$ne`",
                    ))
                }
            })
        }
        Scalar::Number(n) => {
            // Non-numeric or missing fields never satisfy an ordering
            // comparison, but they do satisfy `$ne`.
            let miss = if matches!(op, CompareOp::Ne) { "TRUE" } else { "FALSE" };
            Ok(format!(
                "(CASE WHEN jsonb_typeof({jp}) = 'number' THEN ({tp})::numeric {op} {lit} ELSE {miss} END)",
                jp = path_jsonb(path)?,
                tp = path_text(path)?,
                op = sql_op(op),
                lit = n,
                miss = miss,
            ))
        }
        Scalar::String(s) => {
            let lit = quote_literal(s)?;
            Ok(match op {
                CompareOp::Ne => format!(
                    "COALESCE({} <> {}, TRUE)",
                    path_text(path)?,
                    lit
                ),
                _ => format!("({} {} {})", path_text(path)?, sql_op(op), lit),
            })
        }
    }
}

fn emit_in(path: &FieldPath, values: &[Scalar], negated: bool) -> Result<String, TranslateError> {
    if values.is_empty() {
        // Mongo semantics: $in [] matches nothing, $nin [] everything.
        return Ok(if negated { "TRUE" } else { "FALSE" }.to_string());
    }

    let branches = values
        .iter()
        .map(|v| emit_compare(path, CompareOp::Eq, v))
        .collect::<Result<Vec<_>, _>>()?;
    let any = format!("({})", branches.join(" OR "));

    Ok(if negated {
        // Missing fields belong to the complement.
        format!("NOT COALESCE({}, FALSE)", any)
    } else {
        any
    })
}

fn emit_near(
    path: &FieldPath,
    geometry: &Value,
    min_meters: f64,
    max_meters: Option<f64>,
) -> Result<String, TranslateError> {
    let field = field_geography(path)?;
    let target = geometry_literal(geometry)?;

    Ok(match max_meters {
        Some(max) if min_meters == 0.0 => {
            format!("ST_DWithin({}, {}, {})", field, target, format_meters(max))
        }
        Some(max) => format!(
            "(ST_DWithin({f}, {t}, {max}) AND ST_Distance({f}, {t}) >= {min})",
            f = field,
            t = target,
            max = format_meters(max),
            min = format_meters(min_meters),
        ),
        None if min_meters == 0.0 => {
            // Unbounded ring from zero: any record with a parseable geometry.
            format!("(ST_Distance({}, {}) IS NOT NULL)", field, target)
        }
        None => format!(
            "(ST_Distance({}, {}) >= {})",
            field,
            target,
            format_meters(min_meters)
        ),
    })
}

fn sql_op(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
    }
}

fn format_meters(meters: f64) -> String {
    // Finite and non-negative by construction; Rust float formatting emits
    // only digits, `.`, `-` and `e`, all inert in SQL.
    format!("{}", meters)
}

/// `document #> '{a,b}'`, the JSONB value at the path.
fn path_jsonb(path: &FieldPath) -> Result<String, TranslateError> {
    Ok(format!("(document #> {})", path_literal(path)?))
}

/// `document #>> '{a,b}'`, the path value as text.
fn path_text(path: &FieldPath) -> Result<String, TranslateError> {
    Ok(format!("(document #>> {})", path_literal(path)?))
}

/// Stored geometry goes through `trib_geography`, which returns NULL for
/// anything that is not parseable GeoJSON. Feeding `ST_GeomFromGeoJSON` raw
/// document text would instead abort the whole statement on the first
/// malformed value any connector ever contributed.
fn field_geography(path: &FieldPath) -> Result<String, TranslateError> {
    Ok(format!("trib_geography({})", path_jsonb(path)?))
}

fn geometry_literal(geometry: &Value) -> Result<String, TranslateError> {
    let canonical = canonical::canonical_json_string(geometry);
    Ok(format!(
        "ST_GeomFromGeoJSON({})::geography",
        quote_literal(&canonical)?
    ))
}

/// Quotes each path segment for the Postgres array-literal language and the
/// whole literal for SQL, so a segment can never terminate either context.
fn path_literal(path: &FieldPath) -> Result<String, TranslateError> {
    let mut elements = Vec::with_capacity(path.0.len());
    for segment in &path.0 {
        let escaped = segment.replace('\\', "\\\\").replace('"', "\\\"");
        elements.push(format!("\"{}\"", escaped));
    }
    quote_literal(&format!("{{{}}}", elements.join(",")))
}

/// Single-quoted SQL string literal; embedded quotes are doubled. NUL bytes
/// are rejected because Postgres cannot store them in text at all.
fn quote_literal(s: &str) -> Result<String, TranslateError> {
    if s.bytes().any(|b| b == 0) {
        return Err(TranslateError::shape("string literal contains a NUL byte"));
    }
    Ok(format!("'{}'", s.replace('\'', "''")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_document;
    use serde_json::json;

    fn emit_doc(doc: serde_json::Value) -> String {
        let canonical = canonical::canonicalize_json_value(&doc);
        emit(&parse_document(&canonical).unwrap()).unwrap()
    }

    #[test]
    fn numeric_comparison_guards_on_json_type() {
        let sql = emit_doc(json!({"age": {"$gt": 5}}));
        assert!(sql.contains("jsonb_typeof((document #> '{\"age\"}')) = 'number'"));
        assert!(sql.contains("::numeric > 5"));
        assert!(sql.contains("ELSE FALSE"));
    }

    #[test]
    fn string_literals_cannot_escape_their_quotes() {
        let sql = emit_doc(json!({"name": {"$eq": "x') OR ('1'='1"}}));
        assert!(sql.contains("'x'') OR (''1''=''1'"));
        assert!(!sql.contains("'x')"));
    }

    #[test]
    fn path_segments_are_quoted_for_both_languages() {
        let sql = emit_doc(json!({"entity.po'p\"s": 1}));
        assert!(sql.contains(r#"'{"entity","po''p\"s"}'"#));
    }

    #[test]
    fn ne_matches_missing_fields() {
        let sql = emit_doc(json!({"name": {"$ne": "x"}}));
        assert!(sql.starts_with("COALESCE"));
        assert!(sql.ends_with("TRUE)"));
    }

    #[test]
    fn nin_complements_with_coalesce() {
        let sql = emit_doc(json!({"tag": {"$nin": ["a", "b"]}}));
        assert!(sql.starts_with("NOT COALESCE"));
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        assert_eq!(emit_doc(json!({"tag": {"$in": []}})), "FALSE");
        assert_eq!(emit_doc(json!({"tag": {"$nin": []}})), "TRUE");
    }

    #[test]
    fn contains_requires_an_array_and_uses_containment() {
        let sql = emit_doc(json!({"instance.tags": {"$contains": "scenic"}}));
        assert!(sql.contains("jsonb_typeof"));
        assert!(sql.contains("@> '[\"scenic\"]'::jsonb"));
    }

    #[test]
    fn not_and_nor_match_missing_fields() {
        let sql = emit_doc(json!({"$nor": [{"name": "x"}]}));
        assert!(sql.starts_with("NOT COALESCE"));
        assert!(sql.ends_with("FALSE)"));

        let sql = emit_doc(json!({"age": {"$not": {"$gt": 5}}}));
        assert!(sql.starts_with("NOT COALESCE"));
        assert!(sql.ends_with("FALSE)"));
    }

    #[test]
    fn stored_geometry_is_parsed_through_the_guarded_function() {
        // A connector may have contributed a non-GeoJSON value at the path;
        // the predicate must skip such rows instead of aborting the query.
        let sql = emit_doc(json!({"instance.location": {"$near": {
            "$geometry": {"type": "Point", "coordinates": [-0.1, 51.5]},
            "$max": 25000
        }}}));
        assert!(sql.contains("trib_geography((document #> "));
        assert!(!sql.contains("ST_GeomFromGeoJSON((document"));

        let sql = emit_doc(json!({"loc": {"$within": {
            "type": "Polygon",
            "coordinates": [[[0,0],[0,1],[1,1],[0,0]]]
        }}}));
        assert!(sql.contains("trib_geography((document #> "));
    }

    #[test]
    fn near_with_max_only_is_a_single_dwithin() {
        let sql = emit_doc(json!({"instance.location": {"$near": {
            "$geometry": {"type": "Point", "coordinates": [-0.1, 51.5]},
            "$max": 25000
        }}}));
        assert!(sql.starts_with("ST_DWithin("));
        assert!(sql.contains("::geography"));
        assert!(sql.contains("25000"));
        assert!(!sql.contains("ST_Distance"));
    }

    #[test]
    fn near_with_both_bounds_emits_a_ring() {
        let sql = emit_doc(json!({"loc": {"$near": {
            "$geometry": {"type": "Point", "coordinates": [0, 0]},
            "$min": 10, "$max": 20
        }}}));
        assert!(sql.contains("ST_DWithin"));
        assert!(sql.contains(">= 10"));
    }

    #[test]
    fn within_covers_field_with_target_polygon() {
        let sql = emit_doc(json!({"loc": {"$within": {
            "type": "Polygon",
            "coordinates": [[[0,0],[0,1],[1,1],[0,0]]]
        }}}));
        assert!(sql.starts_with("ST_Covers("));
    }

    #[test]
    fn regex_options_switch_operator() {
        assert!(emit_doc(json!({"name": {"$regex": "^United"}})).contains(" ~ "));
        assert!(
            emit_doc(json!({"name": {"$regex": "^united", "$options": "i"}})).contains(" ~* ")
        );
    }

    #[test]
    fn logical_combinators_nest() {
        let sql = emit_doc(json!({"$or": [
            {"age": {"$lt": 3}},
            {"$and": [{"a": 1}, {"b": {"$ne": 2}}]}
        ]}));
        assert!(sql.contains(" OR "));
        assert!(sql.contains(" AND "));
    }
}
