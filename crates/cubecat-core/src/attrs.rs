//! Evaluation of `{{ … }}` expressions embedded in attribute values.
//!
//! The expression language is deliberately tiny: a call to one of the
//! helpers `lower_bound(coord[, ref])` or `upper_bound(coord[, ref])`,
//! where `coord` names a coordinate variable (an optional `ds.` prefix
//! is accepted) and `ref` is one of `"lower"`, `"upper"`, `"center"`
//! describing what the labels represent. There is no general expression
//! runtime, and none can be enabled.

use std::collections::BTreeMap;

use crate::dataset::Attrs;
use crate::error::{Error, Result};

/// Coordinate labels available to attribute expressions.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub coords: BTreeMap<String, Vec<f64>>,
}

/// Whether any attribute value contains an embedded expression.
pub fn has_expressions(attrs: &Attrs) -> bool {
    attrs.values().any(value_has_expression)
}

fn value_has_expression(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains("{{"),
        serde_json::Value::Array(items) => items.iter().any(value_has_expression),
        serde_json::Value::Object(map) => map.values().any(value_has_expression),
        _ => false,
    }
}

/// Evaluate all embedded expressions in an attribute map.
pub fn eval_attrs(attrs: &Attrs, ctx: &EvalContext) -> Result<Attrs> {
    let mut out = Attrs::new();
    for (key, value) in attrs {
        out.insert(key.clone(), eval_value(value, ctx)?);
    }
    Ok(out)
}

fn eval_value(value: &serde_json::Value, ctx: &EvalContext) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::String(s) if s.contains("{{") => eval_template(s, ctx),
        serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|v| eval_value(v, ctx))
                .collect::<Result<_>>()?,
        )),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), eval_value(v, ctx)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate a string with embedded `{{ … }}` expressions. A string that
/// is exactly one expression keeps the numeric result; mixed content
/// is concatenated as text.
fn eval_template(text: &str, ctx: &EvalContext) -> Result<serde_json::Value> {
    let mut parts: Vec<(bool, String)> = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            parts.push((false, rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            Error::config(format!("unterminated expression in attribute value {text:?}"))
        })?;
        parts.push((true, after[..end].trim().to_string()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        parts.push((false, rest.to_string()));
    }

    if parts.len() == 1 && parts[0].0 {
        return Ok(serde_json::json!(eval_expr(&parts[0].1, ctx)?));
    }

    let mut out = String::new();
    for (is_expr, part) in parts {
        if is_expr {
            out.push_str(&format_number(eval_expr(&part, ctx)?));
        } else {
            out.push_str(&part);
        }
    }
    Ok(serde_json::Value::String(out))
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Where a coordinate's labels sit within their cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelRef {
    Lower,
    Upper,
    Center,
}

fn eval_expr(expr: &str, ctx: &EvalContext) -> Result<f64> {
    let (func, args) = parse_call(expr)?;
    let (coord, label_ref) = parse_args(expr, &args)?;
    let labels = ctx.coords.get(coord).ok_or_else(|| {
        Error::config(format!("unknown coordinate {coord:?} in expression {expr:?}"))
    })?;
    if labels.is_empty() {
        return Err(Error::config(format!(
            "coordinate {coord:?} has no labels in expression {expr:?}"
        )));
    }
    let step = if labels.len() > 1 {
        labels[1] - labels[0]
    } else {
        0.0
    };
    let first = labels[0];
    let last = labels[labels.len() - 1];
    let value = match (func, label_ref) {
        ("lower_bound", LabelRef::Lower) => first,
        ("lower_bound", LabelRef::Center) => first - step / 2.0,
        ("lower_bound", LabelRef::Upper) => first - step,
        ("upper_bound", LabelRef::Upper) => last,
        ("upper_bound", LabelRef::Center) => last + step / 2.0,
        ("upper_bound", LabelRef::Lower) => last + step,
        _ => unreachable!("parse_call only accepts the two helpers"),
    };
    Ok(value)
}

fn parse_call<'a>(expr: &'a str) -> Result<(&'a str, Vec<&'a str>)> {
    let open = expr
        .find('(')
        .ok_or_else(|| Error::config(format!("invalid expression {expr:?}")))?;
    let func = expr[..open].trim();
    if func != "lower_bound" && func != "upper_bound" {
        return Err(Error::config(format!(
            "unknown function {func:?} in expression {expr:?}; only \
             lower_bound and upper_bound are available"
        )));
    }
    let close = expr
        .rfind(')')
        .filter(|&c| c > open)
        .ok_or_else(|| Error::config(format!("invalid expression {expr:?}")))?;
    if !expr[close + 1..].trim().is_empty() {
        return Err(Error::config(format!(
            "trailing content in expression {expr:?}"
        )));
    }
    let args: Vec<&str> = expr[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();
    Ok((func, args))
}

fn parse_args<'a>(expr: &str, args: &[&'a str]) -> Result<(&'a str, LabelRef)> {
    if args.is_empty() || args.len() > 2 {
        return Err(Error::config(format!(
            "expression {expr:?} takes a coordinate and an optional reference"
        )));
    }
    let coord = args[0].strip_prefix("ds.").unwrap_or(args[0]);
    if coord.is_empty()
        || !coord
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::config(format!(
            "invalid coordinate name {coord:?} in expression {expr:?}"
        )));
    }
    let label_ref = match args.get(1) {
        None => LabelRef::Center,
        Some(raw) => {
            let unquoted = raw.trim_matches(|c| c == '"' || c == '\'');
            match unquoted {
                "lower" => LabelRef::Lower,
                "upper" => LabelRef::Upper,
                "center" => LabelRef::Center,
                other => {
                    return Err(Error::config(format!(
                        "invalid reference {other:?} in expression {expr:?}; \
                         expected \"lower\", \"upper\" or \"center\""
                    )));
                }
            }
        }
    };
    Ok((coord, label_ref))
}
