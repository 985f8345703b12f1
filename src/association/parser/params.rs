//! Parameter resolution and `{{ name }}` substitution.
use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::ParseError;
use super::document::{ParameterDecl, ParameterType};

/// A reference the agent resolves itself. Anything else between braces,
/// such as `{{ssm:/path}}`, is left for external resolution.
static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid reference pattern")
});

static WHOLE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{\{\s*([A-Za-z0-9_]+)\s*\}\}$").expect("valid reference pattern")
});

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParameter {
    pub param_type: ParameterType,
    pub value: Value,
}

pub type ResolvedParameters = BTreeMap<String, ResolvedParameter>;

fn resolution(msg: impl Into<String>) -> ParseError {
    ParseError::ParameterResolution(msg.into())
}

/// Combines declarations with the association's values.
pub fn resolve_parameters(
    declared: &BTreeMap<String, ParameterDecl>,
    supplied: &HashMap<String, Value>,
) -> Result<ResolvedParameters, ParseError> {
    let mut unknown: Vec<&str> = supplied
        .keys()
        .filter(|k| !declared.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(resolution(format!("undeclared parameters: {}", unknown.join(", "))));
    }

    let mut resolved = BTreeMap::new();
    for (name, decl) in declared {
        let raw = supplied
            .get(name)
            .or(decl.default.as_ref())
            .ok_or_else(|| resolution(format!("parameter `{name}` has no value and no default")))?;
        let value = coerce(name, decl.param_type, raw)?;
        check_allowed(name, decl, &value)?;
        resolved.insert(
            name.clone(),
            ResolvedParameter {
                param_type: decl.param_type,
                value,
            },
        );
    }
    Ok(resolved)
}

fn coerce(name: &str, ty: ParameterType, raw: &Value) -> Result<Value, ParseError> {
    let mismatch = || resolution(format!("parameter `{name}` is not a valid {ty:?}: {raw}"));
    match ty {
        ParameterType::String => match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Array(items) if items.len() == 1 && items[0].is_string() => Ok(items[0].clone()),
            _ => Err(mismatch()),
        },
        ParameterType::StringList => match raw {
            Value::Array(items) if items.iter().all(Value::is_string) => Ok(raw.clone()),
            _ => Err(mismatch()),
        },
        ParameterType::Integer => match raw {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ParameterType::Boolean => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        ParameterType::StringMap => match raw {
            Value::Object(_) => Ok(raw.clone()),
            _ => Err(mismatch()),
        },
        ParameterType::MapList => match raw {
            Value::Array(items) if items.iter().all(Value::is_object) => Ok(raw.clone()),
            _ => Err(mismatch()),
        },
    }
}

/// Textual form of a scalar.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn check_allowed(name: &str, decl: &ParameterDecl, value: &Value) -> Result<(), ParseError> {
    let items: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).into_iter().collect(),
    };

    if !decl.allowed_values.is_empty() {
        if let Some(bad) = items.iter().find(|v| !decl.allowed_values.contains(v)) {
            return Err(resolution(format!(
                "parameter `{name}` value `{bad}` is not one of [{}]",
                decl.allowed_values.join(", ")
            )));
        }
    }

    if let Some(pattern) = &decl.allowed_pattern {
        let re = Regex::new(pattern)
            .map_err(|e| resolution(format!("parameter `{name}` has an invalid allowedPattern: {e}")))?;
        if let Some(bad) = items.iter().find(|v| !re.is_match(v)) {
            return Err(resolution(format!(
                "parameter `{name}` value `{bad}` does not match `{pattern}`"
            )));
        }
    }
    Ok(())
}

/// Replaces parameter references in every string of `value`.
pub fn substitute(value: &Value, params: &ResolvedParameters) -> Result<Value, ParseError> {
    match value {
        Value::String(s) => substitute_str(s, params),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, params))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn lookup<'a>(name: &str, params: &'a ResolvedParameters) -> Result<&'a ResolvedParameter, ParseError> {
    params
        .get(name)
        .ok_or_else(|| resolution(format!("reference to undeclared parameter `{name}`")))
}

fn substitute_str(s: &str, params: &ResolvedParameters) -> Result<Value, ParseError> {
    if let Some(caps) = WHOLE_REFERENCE.captures(s) {
        return Ok(lookup(&caps[1], params)?.value.clone());
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(s) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let param = lookup(name.as_str(), params)?;
        if !param.param_type.is_scalar() {
            return Err(resolution(format!(
                "parameter `{}` of type {:?} cannot be embedded in a string",
                name.as_str(),
                param.param_type
            )));
        }
        out.push_str(&s[last..whole.start()]);
        out.push_str(&scalar_text(&param.value).unwrap_or_default());
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(ty: ParameterType, default: Option<Value>) -> ParameterDecl {
        ParameterDecl {
            param_type: ty,
            default,
            ..Default::default()
        }
    }

    fn params(pairs: &[(&str, ParameterType, Value)]) -> ResolvedParameters {
        pairs
            .iter()
            .map(|(n, t, v)| (n.to_string(), ResolvedParameter { param_type: *t, value: v.clone() }))
            .collect()
    }

    #[test]
    fn test_default_and_supplied_values() {
        let declared = BTreeMap::from([
            ("a".to_string(), decl(ParameterType::String, Some(json!("dflt")))),
            ("b".to_string(), decl(ParameterType::Integer, None)),
        ]);
        let supplied = HashMap::from([("b".to_string(), json!("42"))]);
        let resolved = resolve_parameters(&declared, &supplied).unwrap();
        assert_eq!(resolved["a"].value, json!("dflt"));
        assert_eq!(resolved["b"].value, json!(42));
    }

    #[test]
    fn test_missing_and_undeclared_fail() {
        let declared = BTreeMap::from([("a".to_string(), decl(ParameterType::String, None))]);
        let err = resolve_parameters(&declared, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ParseError::ParameterResolution(_)));

        let supplied = HashMap::from([("a".to_string(), json!("x")), ("zzz".to_string(), json!("y"))]);
        let err = resolve_parameters(&declared, &supplied).unwrap_err();
        assert_eq!(err, ParseError::ParameterResolution("undeclared parameters: zzz".into()));
    }

    #[test]
    fn test_single_element_list_for_string() {
        let declared = BTreeMap::from([("a".to_string(), decl(ParameterType::String, None))]);
        let supplied = HashMap::from([("a".to_string(), json!(["only"]))]);
        assert_eq!(resolve_parameters(&declared, &supplied).unwrap()["a"].value, json!("only"));

        let supplied = HashMap::from([("a".to_string(), json!(["one", "two"]))]);
        assert!(resolve_parameters(&declared, &supplied).is_err());
    }

    #[test]
    fn test_allowed_values_and_pattern() {
        let mut d = decl(ParameterType::StringList, None);
        d.allowed_values = vec!["x".into(), "y".into()];
        let declared = BTreeMap::from([("a".to_string(), d)]);
        let ok = HashMap::from([("a".to_string(), json!(["x", "y"]))]);
        assert!(resolve_parameters(&declared, &ok).is_ok());
        let bad = HashMap::from([("a".to_string(), json!(["x", "z"]))]);
        assert!(resolve_parameters(&declared, &bad).is_err());

        let mut d = decl(ParameterType::String, None);
        d.allowed_pattern = Some("^[a-z]+$".into());
        let declared = BTreeMap::from([("a".to_string(), d)]);
        assert!(resolve_parameters(&declared, &HashMap::from([("a".to_string(), json!("abc"))])).is_ok());
        assert!(resolve_parameters(&declared, &HashMap::from([("a".to_string(), json!("ABC"))])).is_err());
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let p = params(&[
            ("list", ParameterType::StringList, json!(["a", "b"])),
            ("n", ParameterType::Integer, json!(3)),
        ]);
        let out = substitute(&json!({"items": "{{ list }}", "count": "{{n}}"}), &p).unwrap();
        assert_eq!(out, json!({"items": ["a", "b"], "count": 3}));
    }

    #[test]
    fn test_embedded_reference_is_textual() {
        let p = params(&[
            ("name", ParameterType::String, json!("web")),
            ("n", ParameterType::Integer, json!(3)),
        ]);
        let out = substitute(&json!(["svc-{{ name }}-{{ n }}", "{{ssm:/secret}}"]), &p).unwrap();
        assert_eq!(out, json!(["svc-web-3", "{{ssm:/secret}}"]));
    }

    #[test]
    fn test_embedded_non_scalar_and_unknown_fail() {
        let p = params(&[("list", ParameterType::StringList, json!(["a"]))]);
        assert!(substitute(&json!("x {{ list }}"), &p).is_err());
        assert!(substitute(&json!("{{ missing }}"), &p).is_err());
    }
}
