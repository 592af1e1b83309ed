//! Values file handling
//!
//! Parses helm values with yaml-rust2 into `serde_json::Value`, merges a
//! user overlay over chart defaults, and writes the result back as YAML.

use serde_json::{Map, Number, Value};
use yaml_rust2::yaml::Hash;
use yaml_rust2::{Yaml, YamlEmitter, YamlLoader};

/// Error type for YAML parsing
#[derive(Debug, Clone, PartialEq)]
pub struct YamlError(String);

impl std::fmt::Display for YamlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for YamlError {}

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a values document, which must be a mapping (or empty).
///
/// An empty document yields an empty mapping.
pub fn parse_values(input: &str) -> Result<Map<String, Value>, YamlError> {
    match parse_yaml(input)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(YamlError(format!(
            "values must be a mapping at the top level, found {}",
            type_name(&other)
        ))),
    }
}

/// Merge `overlay` into `base` the way helm layers values files.
///
/// Mappings merge key by key, recursively. Scalars and sequences in the
/// overlay replace the base value. A `null` in the overlay removes the key.
pub fn merge_values(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match value {
            Value::Null => {
                base.remove(&key);
            }
            Value::Object(over) => match base.get_mut(&key) {
                Some(Value::Object(existing)) => merge_values(existing, over),
                _ => {
                    let mut fresh = Map::new();
                    merge_values(&mut fresh, over);
                    base.insert(key, Value::Object(fresh));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Render values back to a YAML document.
///
/// Strings that a YAML 1.1 reader would take for a boolean, null or number
/// (`"yes"`, `"on"`, `"1.10"`) are emitted quoted so helm reads them back as
/// strings.
pub fn to_yaml(values: &Map<String, Value>) -> Result<String, YamlError> {
    let doc = json_to_yaml(&Value::Object(values.clone()));
    let mut out = String::new();
    YamlEmitter::new(&mut out)
        .dump(&doc)
        .map_err(|e| YamlError(e.to_string()))?;

    let mut rendered = match out.strip_prefix("---\n") {
        Some(body) => body.to_string(),
        None => out,
    };
    rendered.push('\n');
    Ok(rendered)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}

/// Convert a serde_json::Value to a yaml_rust2::Yaml value
fn json_to_yaml(value: &Value) -> Yaml {
    match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Yaml::Integer(i),
            None => Yaml::Real(render_float(n)),
        },
        Value::String(s) => Yaml::String(s.clone()),
        Value::Array(items) => Yaml::Array(items.iter().map(json_to_yaml).collect()),
        Value::Object(map) => {
            let mut hash = Hash::new();
            for (k, v) in map {
                hash.insert(Yaml::String(k.clone()), json_to_yaml(v));
            }
            Yaml::Hash(hash)
        }
    }
}

// Whole floats keep a fractional part so they parse back as floats.
fn render_float(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && n.as_u64().is_none() => {
            format!("{:.1}", f)
        }
        _ => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_parse_values_nested() {
        let yaml = r#"
head:
  resources:
    cpu: "2"
    memory: 4Gi
worker:
  replicas: 3
"#;
        let result = parse_values(yaml).unwrap();
        assert_eq!(result["head"]["resources"]["memory"], "4Gi");
        assert_eq!(result["worker"]["replicas"], 3);
    }

    #[test]
    fn test_parse_values_empty_is_empty_map() {
        assert!(parse_values("").unwrap().is_empty());
        assert!(parse_values("# only a comment\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_values_rejects_non_mapping() {
        let err = parse_values("- a\n- b\n").unwrap_err();
        assert!(err.to_string().contains("sequence"));
    }

    #[test]
    fn test_parse_yaml_invalid() {
        assert!(parse_yaml("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn test_parse_yaml_float() {
        let result = parse_yaml("value: 1.5").unwrap();
        let value = result["value"].as_f64().unwrap();
        assert!((value - 1.5).abs() < 0.0001);
    }

    // ==========================================================================
    // Story: layering a user overlay over chart defaults
    // ==========================================================================

    #[test]
    fn story_overlay_overrides_leaves_and_keeps_siblings() {
        let mut base = values(json!({
            "image": {"repository": "ray", "tag": "2.9.0", "pullPolicy": "IfNotPresent"},
            "worker": {"replicas": 1}
        }));
        let overlay = values(json!({
            "image": {"tag": "2.37.0"},
            "worker": {"replicas": 4}
        }));

        merge_values(&mut base, overlay);

        assert_eq!(base["image"]["tag"], "2.37.0");
        assert_eq!(base["image"]["repository"], "ray");
        assert_eq!(base["image"]["pullPolicy"], "IfNotPresent");
        assert_eq!(base["worker"]["replicas"], 4);
    }

    #[test]
    fn story_overlay_sequences_replace_rather_than_append() {
        let mut base = values(json!({"env": [{"name": "A"}, {"name": "B"}]}));
        merge_values(&mut base, values(json!({"env": [{"name": "C"}]})));
        assert_eq!(base["env"], json!([{"name": "C"}]));
    }

    #[test]
    fn story_overlay_null_removes_a_default() {
        let mut base = values(json!({"nodeSelector": {"pool": "gpu"}, "replicas": 1}));
        merge_values(&mut base, values(json!({"nodeSelector": null})));
        assert!(!base.contains_key("nodeSelector"));
        assert_eq!(base["replicas"], 1);
    }

    #[test]
    fn story_overlay_mapping_replaces_scalar() {
        let mut base = values(json!({"resources": "default"}));
        merge_values(&mut base, values(json!({"resources": {"cpu": "2"}})));
        assert_eq!(base["resources"]["cpu"], "2");
    }

    #[test]
    fn test_to_yaml_round_trips_through_parser() {
        let original = values(json!({"head": {"cpu": 2}, "name": "ray"}));
        let rendered = to_yaml(&original).unwrap();
        let parsed = parse_values(&rendered).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn story_quoted_scalars_stay_strings_through_render() {
        let overlay = parse_values("label: \"yes\"\nflag: \"on\"\nversion: \"1.10\"\n").unwrap();
        assert_eq!(overlay["label"], "yes");

        let rendered = to_yaml(&overlay).unwrap();
        assert!(rendered.contains("\"yes\""), "unquoted in:\n{}", rendered);
        assert!(rendered.contains("\"on\""), "unquoted in:\n{}", rendered);
        assert!(rendered.contains("\"1.10\""), "unquoted in:\n{}", rendered);

        let reparsed = parse_values(&rendered).unwrap();
        assert_eq!(reparsed["label"], Value::String("yes".to_string()));
        assert_eq!(reparsed["flag"], Value::String("on".to_string()));
        assert_eq!(reparsed["version"], Value::String("1.10".to_string()));
    }

    #[test]
    fn test_to_yaml_keeps_scalar_types() {
        let original = values(json!({
            "enabled": true,
            "ratio": 0.5,
            "whole": 2.0,
            "replicas": 3,
            "empty": {},
            "args": ["--port", "8265"]
        }));
        let rendered = to_yaml(&original).unwrap();
        assert!(!rendered.starts_with("---"));
        assert_eq!(parse_values(&rendered).unwrap(), original);
    }
}
