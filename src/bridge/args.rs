use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Fold request arguments into a snake_case map. Both spellings of a key
/// are accepted on the wire; the snake_case form wins when both appear.
pub fn normalize(args: Option<Value>) -> CoreResult<Map<String, Value>> {
    let raw = match args {
        None | Some(Value::Null) => return Ok(Map::new()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(CoreError::InvalidRequest(format!(
                "args must be an object, got {}",
                type_name(&other)
            )));
        }
    };

    let mut normalized = Map::new();
    // Snake_case keys are canonical; insert them first so camelCase
    // duplicates never clobber them.
    for (key, value) in &raw {
        if key == &camel_to_snake(key) {
            normalized.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in raw {
        let snake = camel_to_snake(&key);
        normalized.entry(snake).or_insert(value);
    }
    Ok(normalized)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

// --- typed accessors used by handlers ---

pub fn require_str<'a>(args: &'a Map<String, Value>, param: &'static str) -> CoreResult<&'a str> {
    match args.get(param) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(other) => Err(CoreError::ParseParam {
            param,
            detail: format!("expected string, got {}", type_name(other)),
        }),
        None => Err(CoreError::MissingParam(param)),
    }
}

pub fn opt_str(args: &Map<String, Value>, param: &'static str) -> CoreResult<Option<String>> {
    match args.get(param) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(CoreError::ParseParam {
            param,
            detail: format!("expected string, got {}", type_name(other)),
        }),
    }
}

pub fn opt_usize(args: &Map<String, Value>, param: &'static str) -> CoreResult<Option<usize>> {
    match args.get(param) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(|v| Some(v as usize)).ok_or(CoreError::ParseParam {
            param,
            detail: format!("expected unsigned integer, got {n}"),
        }),
        Some(other) => Err(CoreError::ParseParam {
            param,
            detail: format!("expected unsigned integer, got {}", type_name(other)),
        }),
    }
}

/// A single address or an array of addresses.
pub fn require_str_list(args: &Map<String, Value>, param: &'static str) -> CoreResult<Vec<String>> {
    match args.get(param) {
        Some(Value::String(s)) if !s.is_empty() => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) if !s.is_empty() => out.push(s.clone()),
                    other => {
                        return Err(CoreError::ParseParam {
                            param,
                            detail: format!("expected string entries, got {}", type_name(other)),
                        });
                    }
                }
            }
            if out.is_empty() {
                return Err(CoreError::MissingParam(param));
            }
            Ok(out)
        }
        Some(other) => Err(CoreError::ParseParam {
            param,
            detail: format!("expected string or array, got {}", type_name(other)),
        }),
        None => Err(CoreError::MissingParam(param)),
    }
}

pub fn opt_object(
    args: &Map<String, Value>,
    param: &'static str,
) -> CoreResult<Option<Map<String, Value>>> {
    match args.get(param) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(CoreError::ParseParam {
            param,
            detail: format!("expected object, got {}", type_name(other)),
        }),
    }
}
