//! # Param Engine
//!
//! Parses positional and named parameters from their string, sequence,
//! and `{schema, values}` forms, merges CLI-supplied overrides, and
//! applies JSON-Schema defaults and validation (local file or HTTP URL).
//!
//! Positional params are numbered from 1; named params round-trip through
//! shell quoting so a stringified set can be re-split by a sub-DAG call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_yaml::Value;

use crate::dag::{Dag, Param};
use crate::def::DagDef;
use crate::errors::BuildError;

use super::dag::scalar_to_string;
use super::{BuildContext, ParamsSource};

/// Request budget for remote schema fetches.
const SCHEMA_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// TRANSFORMER
// ============================================================================

pub(crate) fn set_params(
    ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let mut schema_ref = None;
    let mut params = match &def.params {
        None => Vec::new(),
        Some(value) => {
            let (params, schema) = parse_dag_params(ctx, value)?;
            schema_ref = schema;
            params
        }
    };

    if let Some(source) = ctx.opts.params.clone() {
        let overrides = match &source {
            ParamsSource::Text(text) => parse_params_text(ctx, text)?,
            ParamsSource::List(items) => parse_params_list(ctx, items)?,
        };
        merge_overrides(&mut params, overrides);
    }

    if let Some(reference) = schema_ref {
        if !ctx.opts.skip_schema_validation {
            let schema = load_schema(ctx, dag, &reference)?;
            apply_schema_defaults(&schema, &mut params);
            validate_against_schema(&schema, &params)?;
        }
    }

    // Named and positional values become visible to later transformers.
    for param in &params {
        ctx.scope.set(param.name.clone(), param.value.clone());
    }
    dag.params = params;
    Ok(())
}

// ============================================================================
// PARSING
// ============================================================================

fn named_key(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some((key, value))
    } else {
        None
    }
}

fn eval_param(ctx: &BuildContext, raw: &str) -> Result<String, BuildError> {
    ctx.evaluator()
        .eval(raw)
        .map_err(|e| BuildError::InvalidParamValue(e.to_string()))
}

/// One shell-quoted string: `"first P1=foo P2=${A001}"`.
fn parse_params_text(ctx: &BuildContext, text: &str) -> Result<Vec<Param>, BuildError> {
    let tokens = shell_words::split(text)
        .map_err(|e| BuildError::InvalidParamValue(format!("{}: {}", text, e)))?;
    parse_params_list(ctx, &tokens)
}

/// Pre-split tokens; each is either `KEY=VALUE` or positional.
fn parse_params_list<S: AsRef<str>>(
    ctx: &BuildContext,
    tokens: &[S],
) -> Result<Vec<Param>, BuildError> {
    let mut params = Vec::with_capacity(tokens.len());
    let mut positional = 0usize;
    for token in tokens {
        let token = token.as_ref();
        match named_key(token) {
            Some((key, value)) => params.push(Param::named(key, eval_param(ctx, value)?)),
            None => {
                positional += 1;
                params.push(Param::positional(positional, eval_param(ctx, token)?));
            }
        }
    }
    Ok(params)
}

/// String, sequence, or `{schema, values}` mapping.
fn parse_dag_params(
    ctx: &BuildContext,
    value: &Value,
) -> Result<(Vec<Param>, Option<String>), BuildError> {
    let eval = |raw: &str| eval_param(ctx, raw);

    match value {
        Value::String(text) => Ok((parse_params_text(ctx, text)?, None)),
        Value::Sequence(items) => {
            let mut params = Vec::with_capacity(items.len());
            let mut positional = 0usize;
            for item in items {
                match item {
                    Value::Mapping(mapping) => {
                        for (k, v) in mapping {
                            let key = k.as_str().ok_or_else(|| {
                                BuildError::InvalidParamValue(
                                    "param names must be strings".to_string(),
                                )
                            })?;
                            let raw = scalar_to_string(v).ok_or_else(|| {
                                BuildError::InvalidParamValue(format!(
                                    "value for {} must be a scalar",
                                    key
                                ))
                            })?;
                            params.push(Param::named(key, eval(&raw)?));
                        }
                    }
                    other => {
                        let raw = scalar_to_string(other).ok_or_else(|| {
                            BuildError::InvalidParamValue(
                                "params must be scalars or single-key mappings".to_string(),
                            )
                        })?;
                        positional += 1;
                        params.push(Param::positional(positional, eval(&raw)?));
                    }
                }
            }
            Ok((params, None))
        }
        Value::Mapping(mapping) => {
            let mut schema = None;
            let mut params = Vec::new();
            for (k, v) in mapping {
                match k.as_str() {
                    Some("schema") => {
                        schema = Some(v.as_str().map(str::to_string).ok_or_else(|| {
                            BuildError::InvalidParamValue("schema must be a string".to_string())
                        })?)
                    }
                    Some("values") => {
                        let values = v.as_mapping().ok_or_else(|| {
                            BuildError::InvalidParamValue("values must be a mapping".to_string())
                        })?;
                        for (name, value) in values {
                            let name = name.as_str().ok_or_else(|| {
                                BuildError::InvalidParamValue(
                                    "param names must be strings".to_string(),
                                )
                            })?;
                            let raw = scalar_to_string(value).ok_or_else(|| {
                                BuildError::InvalidParamValue(format!(
                                    "value for {} must be a scalar",
                                    name
                                ))
                            })?;
                            params.push(Param::named(name, eval(&raw)?));
                        }
                    }
                    _ => {
                        return Err(BuildError::InvalidParamValue(
                            "params mapping may contain only schema and values".to_string(),
                        ))
                    }
                }
            }
            Ok((params, schema))
        }
        other => Err(BuildError::InvalidParamValue(format!(
            "params must be a string, a list, or a mapping, got {:?}",
            other
        ))),
    }
}

/// Step-level params (sub-DAG calls, structured executor params): same
/// grammar minus the schema key.
pub(crate) fn parse_step_params(
    ctx: &BuildContext,
    value: &Value,
) -> Result<Vec<Param>, BuildError> {
    match value {
        Value::Mapping(_) => {
            let mut wrapper = serde_yaml::Mapping::new();
            wrapper.insert(Value::String("values".to_string()), value.clone());
            let (params, _) = parse_dag_params(ctx, &Value::Mapping(wrapper))?;
            Ok(params)
        }
        other => {
            let (params, _) = parse_dag_params(ctx, other)?;
            Ok(params)
        }
    }
}

/// Named overrides replace by name, positional overrides by index; new
/// entries append.
fn merge_overrides(params: &mut Vec<Param>, overrides: Vec<Param>) {
    for over in overrides {
        match params.iter_mut().find(|p| p.name == over.name) {
            Some(existing) => existing.value = over.value,
            None => params.push(over),
        }
    }
}

// ============================================================================
// SERIALIZATION
// ============================================================================

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Named pairs always quote; positional values quote only when they
/// contain whitespace and no `${` marker, so late expansions like
/// `${ITEM.x}` still re-split correctly.
pub(crate) fn stringify_params(params: &[Param]) -> String {
    params
        .iter()
        .map(|p| {
            if p.is_positional() {
                if p.value.chars().any(char::is_whitespace) && !p.value.contains("${") {
                    quote(&p.value)
                } else {
                    p.value.clone()
                }
            } else {
                format!("{}={}", p.name, quote(&p.value))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// SCHEMA
// ============================================================================

fn load_schema(
    ctx: &BuildContext,
    dag: &Dag,
    reference: &str,
) -> Result<serde_json::Value, BuildError> {
    let load_err = |reason: String| BuildError::ParamSchemaLoad {
        location: reference.to_string(),
        reason,
    };

    if reference.starts_with("http://") || reference.starts_with("https://") {
        url::Url::parse(reference).map_err(|e| load_err(e.to_string()))?;
        tracing::debug!(url = reference, "fetching parameter schema");
        let client = reqwest::blocking::Client::builder()
            .timeout(SCHEMA_FETCH_TIMEOUT)
            .build()
            .map_err(|e| load_err(e.to_string()))?;
        let response = client
            .get(reference)
            .send()
            .map_err(|e| load_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(load_err(format!("HTTP {}", response.status())));
        }
        return response.json().map_err(|e| load_err(e.to_string()));
    }

    let path = resolve_schema_path(ctx, dag, reference)
        .ok_or_else(|| load_err("file not found".to_string()))?;
    let text = std::fs::read_to_string(&path).map_err(|e| load_err(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))
}

/// Local refs resolve against the current directory, then the DAG
/// working directory, then the DAG file's directory.
fn resolve_schema_path(ctx: &BuildContext, dag: &Dag, reference: &str) -> Option<PathBuf> {
    let raw = Path::new(reference);
    if raw.is_absolute() {
        return raw.exists().then(|| raw.to_path_buf());
    }
    if raw.exists() {
        return Some(raw.to_path_buf());
    }
    let in_working_dir = dag.working_dir.join(raw);
    if in_working_dir.exists() {
        return Some(in_working_dir);
    }
    let in_location = ctx
        .location
        .as_ref()
        .and_then(|p| p.parent())
        .map(|dir| dir.join(raw))?;
    in_location.exists().then_some(in_location)
}

/// Insert schema property defaults for named params the user left out.
/// Applying this twice is a no-op.
fn apply_schema_defaults(schema: &serde_json::Value, params: &mut Vec<Param>) {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return;
    };
    for (name, property) in properties {
        let Some(default) = property.get("default") else { continue };
        if params.iter().any(|p| p.name == *name) {
            continue;
        }
        let value = match default {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.push(Param::named(name.clone(), value));
    }
}

/// Coerce a string param to the type its schema property declares so the
/// validator sees comparable values.
fn coerce(property: Option<&serde_json::Value>, value: &str) -> serde_json::Value {
    let declared = property
        .and_then(|p| p.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("string");
    match declared {
        "integer" => value
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
        "number" => value
            .parse::<f64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
        "boolean" => value
            .parse::<bool>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
        _ => serde_json::Value::String(value.to_string()),
    }
}

fn validate_against_schema(
    schema: &serde_json::Value,
    params: &[Param],
) -> Result<(), BuildError> {
    let properties = schema.get("properties").and_then(|p| p.as_object());
    let mut instance = serde_json::Map::new();
    for param in params.iter().filter(|p| !p.is_positional()) {
        let property = properties.and_then(|props| props.get(&param.name));
        instance.insert(param.name.clone(), coerce(property, &param.value));
    }
    let instance = serde_json::Value::Object(instance);

    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| {
        BuildError::ParamSchemaLoad {
            location: "schema".to_string(),
            reason: e.to_string(),
        }
    })?;

    if let Err(errors) = compiled.validate(&instance) {
        let mut messages = Vec::new();
        for error in errors {
            let pointer = error.instance_path.to_string();
            let name = pointer.trim_start_matches('/');
            if name.is_empty() {
                messages.push(error.to_string());
            } else {
                messages.push(format!("{}: {}", name, error));
            }
        }
        return Err(BuildError::ParamSchemaViolation(messages.join("; ")));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{build_dag, BuildOpts};
    use crate::def::DagDef;
    use std::io::Write;

    fn build_with(yaml: &str, opts: BuildOpts) -> Result<crate::dag::Dag, crate::errors::ErrorList> {
        let def: DagDef = serde_yaml::from_str(yaml).unwrap();
        build_dag(&def, &opts, None)
    }

    #[test]
    fn test_positional_and_named_with_env_expansion() {
        let yaml = r#"
env:
  - A001: TEXT
params: "first P1=foo P2=${A001}"
steps:
  - echo hi
"#;
        let dag = build_with(yaml, BuildOpts::new()).unwrap();
        let pairs: Vec<(String, String)> = dag
            .params
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("1".to_string(), "first".to_string()),
                ("P1".to_string(), "foo".to_string()),
                ("P2".to_string(), "TEXT".to_string()),
            ]
        );
    }

    #[test]
    fn test_list_of_maps_form() {
        let yaml = "params:\n  - P1: one\n  - P2: two\nsteps:\n  - echo hi\n";
        let dag = build_with(yaml, BuildOpts::new()).unwrap();
        assert_eq!(dag.params[0].name, "P1");
        assert_eq!(dag.params[1].value, "two");
    }

    #[test]
    fn test_cli_overrides_replace_named_and_append_new() {
        let yaml = "params: \"P1=original\"\nsteps:\n  - echo hi\n";
        let dag = build_with(yaml, BuildOpts::new().params("P1=changed P9=extra")).unwrap();
        assert_eq!(dag.params[0].value, "changed");
        assert_eq!(dag.params[1].name, "P9");
    }

    #[test]
    fn test_cli_override_list_form() {
        let yaml = "params: \"P1=original\"\nsteps:\n  - echo hi\n";
        let dag = build_with(yaml, BuildOpts::new().params_list(["P1=changed"])).unwrap();
        assert_eq!(dag.params[0].value, "changed");
    }

    #[test]
    fn test_round_trip_of_named_pairs() {
        let yaml = "params: \"P1=foo P2=bar baz\"\nsteps:\n  - echo hi\n";
        let dag = build_with(yaml, BuildOpts::new()).unwrap();
        let serialized = super::stringify_params(&dag.params);
        assert_eq!(serialized, "P1=\"foo\" P2=\"bar\" baz");

        let reparsed = shell_words::split(&serialized).unwrap();
        assert_eq!(reparsed, vec!["P1=foo", "P2=bar", "baz"]);
    }

    #[test]
    fn test_stringify_smart_escape_preserves_expansions() {
        let params = vec![
            crate::dag::Param::positional(1, "${ITEM.x} ${ITEM.y}"),
            crate::dag::Param::positional(2, "two words"),
        ];
        assert_eq!(
            super::stringify_params(&params),
            "${ITEM.x} ${ITEM.y} \"two words\""
        );
    }

    fn write_schema(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("params.schema.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
  "type": "object",
  "properties": {{
    "batch_size": {{"type": "integer", "minimum": 1, "maximum": 50}},
    "mode": {{"type": "string", "default": "fast"}}
  }}
}}"#
        )
        .unwrap();
        path
    }

    #[test]
    fn test_schema_defaults_applied() {
        let dir = tempfile::tempdir().unwrap();
        let schema = write_schema(dir.path());
        let yaml = format!(
            "params:\n  schema: {}\n  values:\n    batch_size: 10\nsteps:\n  - echo hi\n",
            schema.display()
        );
        let dag = build_with(&yaml, BuildOpts::new()).unwrap();
        let mode = dag.params.iter().find(|p| p.name == "mode").unwrap();
        assert_eq!(mode.value, "fast");
    }

    #[test]
    fn test_schema_violation_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let schema = write_schema(dir.path());
        let yaml = format!(
            "params:\n  schema: {}\n  values:\n    batch_size: 10\nsteps:\n  - echo hi\n",
            schema.display()
        );
        let err = build_with(&yaml, BuildOpts::new().params("batch_size=100")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("parameter validation failed"));
        assert!(message.contains("batch_size"));
    }

    #[test]
    fn test_skip_schema_validation_bypasses_fetch() {
        let yaml =
            "params:\n  schema: /nonexistent/schema.json\n  values:\n    a: 1\nsteps:\n  - echo hi\n";
        let dag = build_with(yaml, BuildOpts::new().skip_schema_validation()).unwrap();
        assert_eq!(dag.params[0].name, "a");
    }

    #[test]
    fn test_missing_local_schema_is_error() {
        let yaml =
            "params:\n  schema: /nonexistent/schema.json\n  values:\n    a: 1\nsteps:\n  - echo hi\n";
        let err = build_with(yaml, BuildOpts::new()).unwrap_err();
        assert!(err.to_string().contains("failed to load parameter schema"));
    }

    #[test]
    fn test_params_visible_to_scope_for_later_fields() {
        // params feed later transformers through the scope, e.g. schedule
        // stays untouched but step env sees them
        let yaml = r#"
params: "TARGET=prod"
steps:
  - command: echo hi
    env:
      - WHERE: ${TARGET}
"#;
        let dag = build_with(yaml, BuildOpts::new()).unwrap();
        assert_eq!(dag.steps[0].env[0].value, "prod");
    }

    #[test]
    fn test_defaulting_is_idempotent() {
        let schema: serde_json::Value = serde_json::json!({
            "type": "object",
            "properties": {"mode": {"type": "string", "default": "fast"}}
        });
        let mut params = vec![crate::dag::Param::named("other", "x")];
        super::apply_schema_defaults(&schema, &mut params);
        let after_first = params.clone();
        super::apply_schema_defaults(&schema, &mut params);
        assert_eq!(params, after_first);
    }
}
