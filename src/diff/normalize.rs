//! Ignore-rule paths
//!
//! Two notations select fields to leave out of comparison:
//! - JSON pointers (`/spec/replicas`, `/metadata/annotations/a~1b`)
//! - dotted paths (`.spec.template.spec.containers[].image`), where `[]`
//!   selects every array element, `[N]` one element and `*` every key

use serde_json::Value;

use crate::models::{Application, ResourceKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key, or array index when the key is numeric.
    Key(String),
    Index(usize),
    AllItems,
    AnyKey,
}

pub type FieldPath = Vec<Segment>;

pub fn parse_json_pointer(pointer: &str) -> Result<FieldPath, String> {
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(format!("JSON pointer '{}' must start with '/'", pointer));
    };
    Ok(rest
        .split('/')
        .map(|token| Segment::Key(token.replace("~1", "/").replace("~0", "~")))
        .collect())
}

pub fn parse_field_path(path: &str) -> Result<FieldPath, String> {
    let trimmed = path.strip_prefix('.').unwrap_or(path);
    if trimmed.is_empty() {
        return Err("empty field path".to_string());
    }

    let mut segments = Vec::new();
    for part in trimmed.split('.') {
        let (name, brackets) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        match name {
            "" if brackets.is_empty() => {
                return Err(format!("empty segment in field path '{}'", path));
            }
            "" => {}
            "*" => segments.push(Segment::AnyKey),
            _ => segments.push(Segment::Key(name.to_string())),
        }

        let mut rest = brackets;
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| format!("unclosed '[' in field path '{}'", path))?;
            let inner = &rest[1..close];
            if inner.is_empty() {
                segments.push(Segment::AllItems);
            } else {
                let index = inner
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index '{}' in field path '{}'", inner, path))?;
                segments.push(Segment::Index(index));
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(format!("unexpected '{}' in field path '{}'", rest, path));
            }
        }
    }
    Ok(segments)
}

/// Paths ignored for `key` under the application's rules. Unparseable
/// entries are rejected earlier by [`validate_rules`] and skipped here.
pub fn ignored_paths(app: &Application, key: &ResourceKey) -> Vec<FieldPath> {
    let mut paths = Vec::new();
    for rule in app
        .sync_policy
        .ignore_differences
        .iter()
        .filter(|r| r.matches(key))
    {
        paths.extend(rule.json_pointers.iter().filter_map(|p| parse_json_pointer(p).ok()));
        paths.extend(rule.field_paths.iter().filter_map(|p| parse_field_path(p).ok()));
    }
    paths
}

pub fn validate_rules(app: &Application) -> Result<(), String> {
    for rule in &app.sync_policy.ignore_differences {
        for pointer in &rule.json_pointers {
            parse_json_pointer(pointer)?;
        }
        for path in &rule.field_paths {
            parse_field_path(path)?;
        }
    }
    Ok(())
}

fn array_index(segment: &Segment) -> Option<usize> {
    match segment {
        Segment::Index(i) => Some(*i),
        Segment::Key(k) => k.parse().ok(),
        _ => None,
    }
}

/// Remove every field selected by `path`.
pub fn remove_path(value: &mut Value, path: &[Segment]) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };

    match value {
        Value::Object(map) => match first {
            Segment::Key(key) if rest.is_empty() => {
                map.remove(key);
            }
            Segment::Key(key) => {
                if let Some(child) = map.get_mut(key) {
                    remove_path(child, rest);
                }
            }
            Segment::AnyKey if rest.is_empty() => map.clear(),
            Segment::AnyKey => {
                for child in map.values_mut() {
                    remove_path(child, rest);
                }
            }
            _ => {}
        },
        Value::Array(items) => match first {
            Segment::AllItems if rest.is_empty() => items.clear(),
            Segment::AllItems => {
                for item in items.iter_mut() {
                    remove_path(item, rest);
                }
            }
            other => {
                let Some(index) = array_index(other) else {
                    return;
                };
                if index >= items.len() {
                    return;
                }
                if rest.is_empty() {
                    items.remove(index);
                } else {
                    remove_path(&mut items[index], rest);
                }
            }
        },
        _ => {}
    }
}

/// Copy the fields selected by `path` from `source` into `target`. A field
/// missing in `source` is removed from `target`.
pub fn overlay_path(target: &mut Value, source: &Value, path: &[Segment]) {
    let Some((first, rest)) = path.split_first() else {
        *target = source.clone();
        return;
    };

    match (target, first) {
        (Value::Object(map), Segment::Key(key)) => match source.get(key) {
            Some(src) if rest.is_empty() => {
                map.insert(key.clone(), src.clone());
            }
            Some(src) => {
                if let Some(child) = map.get_mut(key) {
                    overlay_path(child, src, rest);
                }
            }
            None if rest.is_empty() => {
                map.remove(key);
            }
            None => {}
        },
        (Value::Object(map), Segment::AnyKey) => {
            let Some(src_map) = source.as_object() else {
                return;
            };
            for (key, child) in map.iter_mut() {
                if let Some(src) = src_map.get(key) {
                    overlay_path(child, src, rest);
                }
            }
        }
        (Value::Array(items), Segment::AllItems) => {
            let Some(src_items) = source.as_array() else {
                return;
            };
            for (item, src) in items.iter_mut().zip(src_items) {
                overlay_path(item, src, rest);
            }
        }
        (Value::Array(items), other) => {
            let (Some(index), Some(src_items)) = (array_index(other), source.as_array()) else {
                return;
            };
            if let (Some(item), Some(src)) = (items.get_mut(index), src_items.get(index)) {
                overlay_path(item, src, rest);
            }
        }
        _ => {}
    }
}

/// Copy of `value` with `status` and every ignored path removed.
pub fn normalize(value: &Value, paths: &[FieldPath]) -> Value {
    let mut out = value.clone();
    if let Some(map) = out.as_object_mut() {
        map.remove("status");
    }
    for path in paths {
        remove_path(&mut out, path);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_paths() {
        assert_eq!(
            parse_json_pointer("/metadata/annotations/a~1b").unwrap(),
            vec![
                Segment::Key("metadata".into()),
                Segment::Key("annotations".into()),
                Segment::Key("a/b".into())
            ]
        );
        assert_eq!(
            parse_field_path(".spec.containers[].image").unwrap(),
            vec![
                Segment::Key("spec".into()),
                Segment::Key("containers".into()),
                Segment::AllItems,
                Segment::Key("image".into())
            ]
        );
        assert_eq!(
            parse_field_path("data.*").unwrap(),
            vec![Segment::Key("data".into()), Segment::AnyKey]
        );
        assert!(parse_json_pointer("spec").is_err());
        assert!(parse_field_path(".spec..x").is_err());
        assert!(parse_field_path(".spec.items[x]").is_err());
    }

    #[test]
    fn test_remove_wildcards_and_indices() {
        let mut value = json!({
            "spec": {
                "containers": [
                    {"name": "a", "image": "nginx:1"},
                    {"name": "b", "image": "redis:7"}
                ],
                "replicas": 3
            }
        });
        remove_path(&mut value, &parse_field_path(".spec.containers[].image").unwrap());
        remove_path(&mut value, &parse_json_pointer("/spec/replicas").unwrap());
        assert_eq!(
            value,
            json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}})
        );

        remove_path(&mut value, &parse_json_pointer("/spec/containers/0").unwrap());
        assert_eq!(value, json!({"spec": {"containers": [{"name": "b"}]}}));
    }

    #[test]
    fn test_overlay_keeps_live_values() {
        let mut desired = json!({"spec": {"replicas": 1, "paused": false}});
        let live = json!({"spec": {"replicas": 5}});
        overlay_path(&mut desired, &live, &parse_json_pointer("/spec/replicas").unwrap());
        overlay_path(&mut desired, &live, &parse_json_pointer("/spec/paused").unwrap());
        assert_eq!(desired, json!({"spec": {"replicas": 5}}));
    }

    #[test]
    fn test_normalize_drops_status() {
        let value = json!({"spec": {"a": 1}, "status": {"ready": true}});
        assert_eq!(normalize(&value, &[]), json!({"spec": {"a": 1}}));
    }
}
