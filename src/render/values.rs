//! Chart values: load, deep-merge and apply parameter overrides.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::RenderError;
use crate::models::ChartParameters;
use crate::source::ChartSource;

/// Merge `overlay` into `base`. Maps merge key by key; anything else replaces.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Set `a.b.c` to a scalar parsed from `raw`, creating intermediate maps.
pub fn set_dotted(values: &mut Value, path: &str, raw: &str) -> Result<(), String> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("invalid parameter path '{}'", path));
    }

    let mut current = values;
    for segment in &segments[..segments.len() - 1] {
        current = ensure_object(current)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(segments[segments.len() - 1].to_string(), parse_scalar(raw));
    Ok(())
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with a map"),
    }
}

/// Parameter values are typed the way a shell `--set` flag would be.
fn parse_scalar(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else if let Some(n) = raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(n)
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

fn parse_yaml_map(file: &str, content: &str) -> Result<Value, RenderError> {
    let value = Value::deserialize(serde_yaml::Deserializer::from_str(content)).map_err(|e| {
        RenderError::InvalidManifest {
            file: file.to_string(),
            message: e.to_string(),
        }
    })?;
    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(value),
        _ => Err(RenderError::InvalidManifest {
            file: file.to_string(),
            message: "values must be a map".to_string(),
        }),
    }
}

/// Compute the effective values of a chart: `values.yaml`, then each value
/// file in order, then parameters.
pub fn effective_values(
    chart: &ChartSource,
    parameters: Option<&ChartParameters>,
) -> Result<Value, RenderError> {
    let mut values = match chart.values_yaml() {
        Some(content) => parse_yaml_map("values.yaml", content)?,
        None => Value::Object(Map::new()),
    };

    let Some(parameters) = parameters else {
        return Ok(values);
    };

    for file in &parameters.value_files {
        let content = chart.file(file).ok_or_else(|| RenderError::MissingValue {
            file: file.clone(),
            message: "value file not found in chart".to_string(),
        })?;
        deep_merge(&mut values, parse_yaml_map(file, content)?);
    }

    for (path, raw) in &parameters.parameters {
        set_dotted(&mut values, path, raw).map_err(|message| RenderError::MissingValue {
            file: "parameters".to_string(),
            message,
        })?;
    }

    Ok(values)
}
