//! # Cross-Field Validator
//!
//! Runs once after the transformer pipelines succeed:
//!
//! - combined name/id namespace uniqueness
//! - the executor capability matrix (which features each executor type
//!   can carry)
//! - per-type executor config schemas (unknown config keys rejected)
//! - stdout/stderr disjointness
//! - router completeness

use std::collections::HashMap;

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::json;

use crate::dag::Dag;
use crate::errors::BuildError;
use crate::step::Step;

use super::BuildContext;

// ============================================================================
// CAPABILITY MATRIX
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Command,
    MultipleCommands,
    Script,
    Shell,
    Container,
    SubDag,
    WorkerSelector,
    Llm,
    Agent,
    Router,
}

use Capability::*;

/// Features each executor type supports. The empty type is the default
/// shell executor.
fn capabilities(executor_type: &str) -> Option<&'static [Capability]> {
    Some(match executor_type {
        "" | "shell" => &[Command, MultipleCommands, Script, Shell, WorkerSelector],
        "docker" | "container" => &[
            Command,
            MultipleCommands,
            Script,
            Shell,
            Container,
            WorkerSelector,
        ],
        "ssh" => &[Command, MultipleCommands, Script, Shell, WorkerSelector],
        "http" => &[Command, WorkerSelector],
        "jq" => &[Command],
        "redis" => &[Command],
        "mail" => &[Command],
        "dag" => &[SubDag, WorkerSelector],
        "parallel" => &[Command, SubDag, WorkerSelector],
        "chat" => &[Llm],
        "agent" => &[Llm, Agent],
        "router" => &[Router],
        _ => return None,
    })
}

// ============================================================================
// EXECUTOR CONFIG SCHEMAS
// ============================================================================

/// Per-type config schemas; `additionalProperties: false` rejects unknown
/// config keys. Types without an entry take arbitrary config.
static CONFIG_SCHEMAS: Lazy<HashMap<&'static str, JSONSchema>> = Lazy::new(|| {
    let sources = [
        (
            "http",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "method": {"type": "string"},
                    "headers": {"type": "object"},
                    "query": {"type": "object"},
                    "body": {},
                    "timeoutSec": {"type": "integer", "minimum": 0},
                    "skipTLSVerify": {"type": "boolean"},
                    "silent": {"type": "boolean"},
                    "json": {"type": "boolean"}
                },
                "additionalProperties": false
            }),
        ),
        (
            "ssh",
            json!({
                "type": "object",
                "properties": {
                    "user": {"type": "string"},
                    "host": {"type": "string"},
                    "port": {"type": ["integer", "string"]},
                    "key": {"type": "string"},
                    "password": {"type": "string"},
                    "strictHostKey": {"type": "boolean"},
                    "knownHostFile": {"type": "string"}
                },
                "additionalProperties": false
            }),
        ),
        (
            "docker",
            json!({
                "type": "object",
                "properties": {
                    "image": {"type": "string"},
                    "containerName": {"type": "string"},
                    "pull": {"type": ["boolean", "string"]},
                    "autoRemove": {"type": "boolean"},
                    "host": {"type": "string"},
                    "network": {"type": "string"},
                    "platform": {"type": "string"},
                    "volumes": {"type": "array", "items": {"type": "string"}},
                    "env": {},
                    "workingDir": {"type": "string"}
                },
                "additionalProperties": false
            }),
        ),
        (
            "mail",
            json!({
                "type": "object",
                "properties": {
                    "to": {"type": ["string", "array"]},
                    "from": {"type": "string"},
                    "subject": {"type": "string"},
                    "message": {"type": "string"},
                    "attachLogs": {"type": "boolean"},
                    "attachments": {"type": "array", "items": {"type": "string"}}
                },
                "additionalProperties": false
            }),
        ),
        (
            "jq",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "raw": {"type": "boolean"}
                },
                "additionalProperties": false
            }),
        ),
        (
            "redis",
            json!({
                "type": "object",
                "properties": {
                    "host": {"type": "string"},
                    "port": {"type": ["integer", "string"]},
                    "password": {"type": "string"},
                    "db": {"type": "integer"},
                    "key": {"type": "string"},
                    "value": {"type": "string"}
                },
                "additionalProperties": false
            }),
        ),
    ];
    sources
        .into_iter()
        .map(|(name, schema)| {
            let compiled = JSONSchema::compile(&schema).expect("static executor config schema");
            (name, compiled)
        })
        .collect()
});

// ============================================================================
// VALIDATION
// ============================================================================

pub(crate) fn validate_dag(ctx: &mut BuildContext, dag: &Dag) {
    validate_namespace(ctx, dag);
    for (i, step) in dag.steps.iter().enumerate() {
        validate_step(ctx, &format!("steps[{}]", i), step);
    }
    let handlers = [
        ("handlerOn.onInit", &dag.handler_on.init),
        ("handlerOn.onExit", &dag.handler_on.exit),
        ("handlerOn.onSuccess", &dag.handler_on.success),
        ("handlerOn.onFailure", &dag.handler_on.failure),
        ("handlerOn.onCancel", &dag.handler_on.cancel),
    ];
    for (prefix, handler) in handlers {
        if let Some(step) = handler {
            validate_step(ctx, prefix, step);
        }
    }
}

/// Names and ids share one namespace: no duplicate names, no duplicate
/// ids, and no id may collide with another step's name.
fn validate_namespace(ctx: &mut BuildContext, dag: &Dag) {
    for (i, step) in dag.steps.iter().enumerate() {
        let field = format!("steps[{}]", i);
        if dag.steps[..i].iter().any(|other| other.name == step.name) {
            ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue(format!("duplicate step name: {}", step.name)),
            );
        }
        let Some(id) = &step.id else { continue };
        if dag.steps[..i]
            .iter()
            .any(|other| other.id.as_deref() == Some(id))
        {
            ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue(format!("duplicate step id: {}", id)),
            );
        }
        if dag
            .steps
            .iter()
            .enumerate()
            .any(|(j, other)| j != i && other.name == *id)
        {
            ctx.errors.push(
                field,
                BuildError::InvalidValue(format!(
                    "step id {} conflicts with a step name",
                    id
                )),
            );
        }
    }
}

fn validate_step(ctx: &mut BuildContext, prefix: &str, step: &Step) {
    let executor_type = step.executor.executor_type.as_str();
    let Some(caps) = capabilities(executor_type) else {
        ctx.errors.push(
            format!("{}.executor", prefix),
            BuildError::InvalidValue(format!("unknown executor type: {}", executor_type)),
        );
        return;
    };
    let has = |cap: Capability| caps.contains(&cap);
    let display_type = if executor_type.is_empty() {
        "shell"
    } else {
        executor_type
    };

    if !step.commands.is_empty() && !has(Command) {
        ctx.errors.push(
            format!("{}.command", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support command",
                display_type
            )),
        );
    }
    if step.commands.len() > 1 && !has(MultipleCommands) {
        ctx.errors.push(
            format!("{}.command", prefix),
            BuildError::ExecutorDoesNotSupportMultipleCmd,
        );
    }
    if step.script.is_some() && !has(Script) {
        ctx.errors.push(
            format!("{}.script", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support script",
                display_type
            )),
        );
    }
    if !step.shell.is_empty() && !has(Shell) {
        ctx.errors.push(
            format!("{}.shell", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support shell",
                display_type
            )),
        );
    }
    if step.container.is_some() && !has(Container) {
        ctx.errors.push(
            format!("{}.container", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support container",
                display_type
            )),
        );
    }
    if step.sub_dag.is_some() && !has(SubDag) {
        ctx.errors.push(
            format!("{}.call", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support sub-DAG calls",
                display_type
            )),
        );
    }
    if (step.llm.is_some() || !step.messages.is_empty()) && !has(Llm) {
        ctx.errors.push(
            format!("{}.llm", prefix),
            BuildError::InvalidValue(format!("executor {} does not support llm", display_type)),
        );
    }
    if step.agent.is_some() && !has(Agent) {
        ctx.errors.push(
            format!("{}.agent", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support agent",
                display_type
            )),
        );
    }
    if step.router.is_some() && !has(Router) {
        ctx.errors.push(
            format!("{}.routes", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support routes",
                display_type
            )),
        );
    }
    if !step.worker_selector.is_empty() && !has(WorkerSelector) {
        ctx.errors.push(
            format!("{}.workerSelector", prefix),
            BuildError::InvalidValue(format!(
                "executor {} does not support workerSelector",
                display_type
            )),
        );
    }

    validate_streams(ctx, prefix, step);
    validate_executor_config(ctx, prefix, step);
    validate_router(ctx, prefix, step);
}

fn validate_streams(ctx: &mut BuildContext, prefix: &str, step: &Step) {
    if let (Some(stdout), Some(stderr)) = (&step.stdout, &step.stderr) {
        if stdout == stderr {
            ctx.errors.push(
                format!("{}.stderr", prefix),
                BuildError::InvalidValue(
                    "stdout and stderr must not be the same file; use 'log_output: merged' instead"
                        .to_string(),
                ),
            );
        }
    }
}

fn validate_executor_config(ctx: &mut BuildContext, prefix: &str, step: &Step) {
    if step.executor.config.is_empty() {
        return;
    }
    let Some(schema) = CONFIG_SCHEMAS.get(step.executor.executor_type.as_str()) else {
        return;
    };
    let instance = serde_json::Value::Object(
        step.executor
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let validation_result = schema.validate(&instance);
    if let Err(errors) = validation_result {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        ctx.errors.push(
            format!("{}.executor.config", prefix),
            BuildError::InvalidValue(format!(
                "invalid {} executor config: {}",
                step.executor.executor_type,
                messages.join("; ")
            )),
        );
    }
}

/// Builder-level route parsing already normalized ordering; this enforces
/// the completeness rules for steps that reached validation.
fn validate_router(ctx: &mut BuildContext, prefix: &str, step: &Step) {
    let Some(router) = &step.router else {
        if step.executor.executor_type == "router" {
            ctx.errors.push(
                format!("{}.value", prefix),
                BuildError::InvalidValue("router requires a value".to_string()),
            );
            ctx.errors.push(
                format!("{}.routes", prefix),
                BuildError::InvalidValue("router requires at least one route".to_string()),
            );
        }
        return;
    };
    if router.value.is_empty() {
        ctx.errors.push(
            format!("{}.value", prefix),
            BuildError::InvalidValue("router requires a value".to_string()),
        );
    }
    if router.routes.is_empty() {
        ctx.errors.push(
            format!("{}.routes", prefix),
            BuildError::InvalidValue("router requires at least one route".to_string()),
        );
    }
    for route in &router.routes {
        if let Some(pattern) = route.pattern.strip_prefix("re:") {
            if regex::Regex::new(pattern).is_err() {
                ctx.errors.push(
                    format!("{}.routes", prefix),
                    BuildError::InvalidValue(format!(
                        "invalid route pattern: {}",
                        route.pattern
                    )),
                );
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{build_dag, BuildOpts};
    use crate::def::DagDef;

    fn build_err(yaml: &str) -> String {
        let def: DagDef = serde_yaml::from_str(yaml).unwrap();
        build_dag(&def, &BuildOpts::new(), None)
            .unwrap_err()
            .to_string()
    }

    fn build(yaml: &str) -> crate::dag::Dag {
        let def: DagDef = serde_yaml::from_str(yaml).unwrap();
        build_dag(&def, &BuildOpts::new(), None).unwrap()
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let err = build_err(
            "steps:\n  - name: same\n    command: echo a\n  - name: same\n    command: echo b\n",
        );
        assert!(err.contains("duplicate step name: same"));
    }

    #[test]
    fn test_id_name_cross_collision_rejected() {
        let err = build_err(
            r#"
steps:
  - name: alpha
    command: echo a
  - name: beta
    id: alpha
    command: echo b
"#,
        );
        assert!(err.contains("conflicts with a step name"));
    }

    #[test]
    fn test_multiple_commands_need_capability() {
        // the default shell executor supports command lists
        let dag = build("steps:\n  - command:\n      - echo a\n      - echo b\n");
        assert_eq!(dag.steps[0].commands.len(), 2);

        let err = build_err(
            r#"
steps:
  - executor: http
    command:
      - echo a
      - echo b
    config:
      url: https://example.com
"#,
        );
        assert!(err.contains("executor does not support multiple commands"));
    }

    #[test]
    fn test_stdout_stderr_disjoint() {
        let err = build_err(
            "steps:\n  - command: echo a\n    stdout: /tmp/out.log\n    stderr: /tmp/out.log\n",
        );
        assert!(err.contains("use 'log_output: merged' instead"));
    }

    #[test]
    fn test_unknown_executor_type() {
        let err = build_err("steps:\n  - command: echo a\n    executor: teleport\n");
        assert!(err.contains("unknown executor type: teleport"));
    }

    #[test]
    fn test_unknown_config_keys_rejected() {
        let err = build_err(
            r#"
steps:
  - executor:
      type: http
      config:
        url: https://example.com
        verb: GET
"#,
        );
        assert!(err.contains("invalid http executor config"));
    }

    #[test]
    fn test_valid_http_config_passes() {
        let dag = build(
            r#"
steps:
  - executor:
      type: http
      config:
        url: https://example.com
        method: POST
        timeoutSec: 10
"#,
        );
        assert_eq!(dag.steps[0].executor.executor_type, "http");
    }

    #[test]
    fn test_script_not_supported_on_http() {
        let err = build_err(
            r#"
steps:
  - executor: http
    script: |
      echo hi
    config:
      url: https://example.com
"#,
        );
        assert!(err.contains("does not support script"));
    }

    #[test]
    fn test_llm_on_shell_executor_rejected() {
        let err = build_err(
            "steps:\n  - command: echo a\n    executor: shell\n    llm:\n      model: m\n",
        );
        assert!(err.contains("does not support llm"));
    }

    #[test]
    fn test_invalid_route_regex() {
        let err = build_err(
            r#"
steps:
  - name: r
    type: router
    value: ${X}
    routes:
      "re:[": target
"#,
        );
        assert!(err.contains("invalid route pattern"));
    }
}
