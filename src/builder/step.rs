//! # Step Field Transformers
//!
//! Builds typed [`Step`]s from raw definitions: shorthand and nested
//! parallel groups, auto-naming, id rules, command grammar, policies,
//! executor inference, fan-out, sub-DAG invocation, and the LLM/agent/
//! router configs.
//!
//! Unlike the DAG transformers, step building pushes its errors directly
//! into the context with full `steps[i].field` paths, so one bad step
//! never hides problems in its siblings.

use std::collections::HashSet;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;

use crate::dag::{Condition, Dag, EnvVar};
use crate::def::{ensure_known_keys, LlmDef, StepDef, STEP_KEYS};
use crate::errors::BuildError;
use crate::eval::Evaluator;
use crate::step::{
    AgentConfig, Command, ExecutorConfig, LlmConfig, LogOutput, Message, ModelRef, Output,
    ParallelConfig, ParallelItem, RepeatMode, RepeatPolicy, RetryPolicy, Route, RouterConfig,
    Step, SubDag,
};

use super::dag::{build_container, parse_conditions, parse_shell, scalar_to_string, string_or_list};
use super::params;
use super::BuildContext;

/// Step ids: `[A-Za-z_][A-Za-z0-9_-]*`.
static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("id pattern"));

/// Ids that would collide with variable names the runtime reserves.
pub const RESERVED_IDS: &[&str] = &[
    "env", "params", "stdout", "stderr", "output", "exit_code", "name", "step", "steps", "dag",
];

/// Signal names accepted by `signalOnStop`.
const SIGNALS: &[&str] = &[
    "SIGABRT", "SIGALRM", "SIGBUS", "SIGCHLD", "SIGCONT", "SIGHUP", "SIGINT", "SIGKILL",
    "SIGPIPE", "SIGQUIT", "SIGSEGV", "SIGSTOP", "SIGTERM", "SIGTSTP", "SIGUSR1", "SIGUSR2",
];

// ============================================================================
// STEPS TRANSFORMER
// ============================================================================

/// Parse the `steps` sequence: each entry is a step (string or mapping)
/// or a nested sequence forming a parallel group.
pub(crate) fn set_steps(
    ctx: &mut BuildContext,
    def: &crate::def::DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let Some(value) = &def.steps else { return Ok(()) };
    let entries = value
        .as_sequence()
        .ok_or_else(|| BuildError::InvalidValue("steps must be a list".to_string()))?;

    // Group structure: a scalar/mapping entry is a single-element group,
    // a nested sequence is one group of parallel siblings. Ordinals track
    // source positions so error paths stay stable past a bad entry.
    let mut groups: Vec<Vec<(usize, StepDef)>> = Vec::new();
    let mut ordinal = 0usize;
    for entry in entries {
        let raw_group: Vec<&Value> = match entry {
            Value::Sequence(siblings) => siblings.iter().collect(),
            other => vec![other],
        };
        let mut group = Vec::new();
        for raw in raw_group {
            match decode_step(raw) {
                Ok(step_def) => group.push((ordinal, step_def)),
                Err(e) => ctx.errors.push(format!("steps[{}]", ordinal), e),
            }
            ordinal += 1;
        }
        groups.push(group);
    }

    let mut namer = AutoNamer::new(&groups);
    let mut steps: Vec<Step> = Vec::new();
    for group in &groups {
        let mut group_names = Vec::with_capacity(group.len());
        for (ordinal, step_def) in group {
            let prefix = format!("steps[{}]", ordinal);
            let step = build_step(ctx, step_def, &prefix, &mut namer, dag);
            group_names.push(step.name.clone());
            steps.push(step);
        }
        ctx.step_groups.push(group_names);
    }
    dag.steps = steps;
    Ok(())
}

/// A step entry is a mapping, or a scalar treated as `command`.
fn decode_step(value: &Value) -> Result<StepDef, BuildError> {
    match value {
        Value::String(s) => Ok(StepDef {
            command: Some(Value::String(s.clone())),
            ..Default::default()
        }),
        Value::Mapping(mapping) => {
            ensure_known_keys(mapping, STEP_KEYS)?;
            Ok(serde_yaml::from_value(value.clone())?)
        }
        Value::Sequence(_) => Err(BuildError::InvalidValue(
            "nested step groups cannot contain further groups".to_string(),
        )),
        _ => Err(BuildError::InvalidValue(
            "step must be a string or a mapping".to_string(),
        )),
    }
}

/// Handler steps (`handlerOn.*`) reuse the step builder with a fixed
/// fallback name and no group bookkeeping.
pub(crate) fn build_handler_step(
    ctx: &mut BuildContext,
    value: &Value,
    default_name: &str,
    dag: &Dag,
) -> Result<Step, BuildError> {
    let mut def = decode_step(value)?;
    if def.name.is_none() {
        def.name = Some(default_name.to_string());
    }
    let mut namer = AutoNamer::default();
    Ok(build_step(
        ctx,
        &def,
        &format!("handlerOn.{}", default_name),
        &mut namer,
        dag,
    ))
}

// ============================================================================
// AUTO-NAMING
// ============================================================================

/// Synthesizes `{kind}_{ordinal}` names for unnamed steps. The ordinal is
/// the global position among all steps; collisions with explicit names
/// advance the number until free, and never reuse a produced name.
#[derive(Default)]
struct AutoNamer {
    taken: HashSet<String>,
    ordinal: usize,
}

impl AutoNamer {
    fn new(groups: &[Vec<(usize, StepDef)>]) -> Self {
        let taken = groups
            .iter()
            .flatten()
            .filter_map(|(_, d)| d.name.clone())
            .collect();
        Self { taken, ordinal: 0 }
    }

    /// Advance the ordinal for every step; assign a name only when the
    /// definition has none.
    fn name_for(&mut self, def: &StepDef, kind: &str) -> String {
        self.ordinal += 1;
        if let Some(name) = &def.name {
            return name.clone();
        }
        let mut n = self.ordinal;
        loop {
            let candidate = format!("{}_{}", kind, n);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Name kind from the step shape.
fn step_kind(def: &StepDef) -> String {
    if let Some(explicit) = explicit_executor_type(def) {
        if !explicit.is_empty() {
            return explicit;
        }
    }
    if def.script.is_some() {
        return "script".to_string();
    }
    if def.call.is_some() || def.run.is_some() {
        return "dag".to_string();
    }
    "cmd".to_string()
}

fn explicit_executor_type(def: &StepDef) -> Option<String> {
    if let Some(t) = &def.step_type {
        return Some(t.clone());
    }
    match &def.executor {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Mapping(m)) => m.get("type").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

// ============================================================================
// STEP BUILDER
// ============================================================================

/// Build one step, best-effort: errors go into the context under
/// `{prefix}.field` paths and the remaining fields still materialize.
fn build_step(
    ctx: &mut BuildContext,
    def: &StepDef,
    prefix: &str,
    namer: &mut AutoNamer,
    dag: &Dag,
) -> Step {
    let mut step = Step {
        name: namer.name_for(def, &step_kind(def)),
        description: def.description.clone().unwrap_or_default(),
        mail_on_error: def.mail_on_error.unwrap_or_default(),
        shell_packages: def.shell_packages.clone().unwrap_or_default(),
        stdout: def.stdout.clone().filter(|s| !s.is_empty()),
        stderr: def.stderr.clone().filter(|s| !s.is_empty()),
        worker_selector: def.worker_selector.clone().unwrap_or_default(),
        ..Default::default()
    };

    set_id(ctx, def, prefix, &mut step);
    set_dir(ctx, def, prefix, &mut step);
    set_step_shell(ctx, def, prefix, &mut step);
    set_commands(ctx, def, prefix, &mut step);
    set_log_output(ctx, def, prefix, &mut step);
    set_output(ctx, def, prefix, &mut step);
    set_depends(ctx, def, prefix, &mut step);
    set_continue_on(ctx, def, prefix, &mut step);
    set_retry_policy(ctx, def, prefix, &mut step);
    set_repeat_policy(ctx, def, prefix, &mut step);
    set_signal_on_stop(ctx, def, prefix, &mut step);
    set_timeout(ctx, def, prefix, &mut step);
    set_step_preconditions(ctx, def, prefix, &mut step);
    set_step_env(ctx, def, prefix, &mut step);
    set_step_container(ctx, def, prefix, &mut step);
    set_parallel(ctx, def, prefix, &mut step);
    set_executor(ctx, def, prefix, &mut step, dag);
    set_sub_dag(ctx, def, prefix, &mut step);
    set_llm(ctx, def, prefix, &mut step);
    set_messages(ctx, def, prefix, &mut step);
    set_agent(ctx, def, prefix, &mut step);
    set_router(ctx, def, prefix, &mut step);
    set_step_params(ctx, def, prefix, &mut step);
    check_actionable(ctx, prefix, &step);

    step
}

fn set_id(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(id) = &def.id else { return };
    if !ID_PATTERN.is_match(id) {
        ctx.errors.push(
            format!("{}.id", prefix),
            BuildError::InvalidValue(format!("invalid step id: {}", id)),
        );
        return;
    }
    if RESERVED_IDS.contains(&id.as_str()) {
        ctx.errors.push(
            format!("{}.id", prefix),
            BuildError::InvalidValue(format!("step id must not be a reserved word: {}", id)),
        );
        return;
    }
    step.id = Some(id.clone());
}

/// `workingDir` wins over `dir`.
fn set_dir(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let raw = def.working_dir.as_ref().or(def.dir.as_ref());
    let Some(raw) = raw else { return };
    match ctx.evaluator().eval(raw) {
        Ok(dir) => step.dir = dir,
        Err(e) => ctx.errors.push(
            format!("{}.dir", prefix),
            BuildError::InvalidValue(e.to_string()),
        ),
    }
}

fn set_step_shell(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    match parse_shell(ctx, def.shell.as_ref()) {
        Ok(Some((shell, args))) => {
            step.shell = shell;
            step.shell_args = args;
        }
        Ok(None) => {}
        Err(e) => ctx.errors.push(format!("{}.shell", prefix), e),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Split on shell grammar; inputs the splitter rejects (stray quotes,
/// backticks mid-word) fall back to the whole string as the command.
fn split_command(raw: &str) -> Command {
    match shell_words::split(raw) {
        Ok(parts) if !parts.is_empty() => Command {
            command: parts[0].clone(),
            args: parts[1..].to_vec(),
            cmd_with_args: raw.to_string(),
        },
        _ => Command {
            command: raw.to_string(),
            args: Vec::new(),
            cmd_with_args: raw.to_string(),
        },
    }
}

fn set_commands(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    step.script = def.script.clone();
    let Some(value) = &def.command else { return };

    let field = format!("{}.command", prefix);
    match value {
        Value::String(s) if s.contains('\n') => {
            // A multi-line command is a script in disguise.
            if step.script.is_some() {
                ctx.errors.push(
                    field,
                    BuildError::InvalidValue(
                        "a multi-line command cannot be combined with script".to_string(),
                    ),
                );
            } else {
                step.script = Some(s.clone());
            }
        }
        Value::String(s) => {
            if s.trim().is_empty() {
                ctx.errors.push(field, BuildError::StepCommandIsEmpty);
            } else {
                step.commands.push(split_command(s));
            }
        }
        Value::Sequence(items) => {
            for item in items {
                match item {
                    Value::Sequence(argv) => match parse_argv(argv) {
                        Ok(cmd) => step.commands.push(cmd),
                        Err(e) => ctx.errors.push(field.clone(), e),
                    },
                    other => match scalar_to_string(other) {
                        Some(s) if !s.trim().is_empty() => step.commands.push(split_command(&s)),
                        Some(_) => ctx.errors.push(field.clone(), BuildError::StepCommandIsEmpty),
                        None => ctx
                            .errors
                            .push(field.clone(), BuildError::StepCommandMustBeArrayOrString),
                    },
                }
            }
        }
        other => match scalar_to_string(other) {
            Some(s) => step.commands.push(split_command(&s)),
            None => ctx
                .errors
                .push(field, BuildError::StepCommandMustBeArrayOrString),
        },
    }
}

/// Argv form: a nested sequence of primitives, no shell splitting.
fn parse_argv(argv: &[Value]) -> Result<Command, BuildError> {
    let parts: Vec<String> = argv
        .iter()
        .map(|v| scalar_to_string(v).ok_or(BuildError::StepCommandMustBeArrayOrString))
        .collect::<Result<_, _>>()?;
    let mut iter = parts.iter();
    let command = iter.next().ok_or(BuildError::StepCommandIsEmpty)?.clone();
    Ok(Command {
        command,
        args: parts[1..].to_vec(),
        cmd_with_args: shell_words::join(&parts),
    })
}

// ============================================================================
// OUTPUT / LOGGING
// ============================================================================

fn set_log_output(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(raw) = &def.log_output else { return };
    step.log_output = match raw.as_str() {
        "separate" => Some(LogOutput::Separate),
        "merged" => Some(LogOutput::Merged),
        other => {
            ctx.errors.push(
                format!("{}.logOutput", prefix),
                BuildError::InvalidValue(format!(
                    "logOutput must be separate or merged, got {}",
                    other
                )),
            );
            None
        }
    };
}

/// Bare name (optional leading `$` stripped) or `{name, key, omit}`.
fn set_output(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.output else { return };
    let field = format!("{}.output", prefix);
    match value {
        Value::String(s) => {
            step.output = Some(Output {
                name: s.strip_prefix('$').unwrap_or(s).to_string(),
                key: None,
                omit: false,
            })
        }
        Value::Mapping(mapping) => {
            let mut output = Output::default();
            for (k, v) in mapping {
                match k.as_str() {
                    Some("name") => match v.as_str() {
                        Some(name) => {
                            output.name = name.strip_prefix('$').unwrap_or(name).to_string()
                        }
                        None => ctx.errors.push(
                            field.clone(),
                            BuildError::InvalidValue("output name must be a string".to_string()),
                        ),
                    },
                    Some("key") => output.key = v.as_str().map(str::to_string),
                    Some("omit") => match v.as_bool() {
                        Some(omit) => output.omit = omit,
                        None => ctx.errors.push(
                            field.clone(),
                            BuildError::InvalidValue("output omit must be a boolean".to_string()),
                        ),
                    },
                    _ => ctx.errors.push(
                        field.clone(),
                        BuildError::InvalidValue(
                            "output may contain only name, key, omit".to_string(),
                        ),
                    ),
                }
            }
            if output.name.is_empty() {
                ctx.errors.push(
                    field,
                    BuildError::InvalidValue("output requires a name".to_string()),
                );
            } else {
                step.output = Some(output);
            }
        }
        _ => ctx.errors.push(
            field,
            BuildError::InvalidValue("output must be a string or a mapping".to_string()),
        ),
    }
}

// ============================================================================
// DEPENDS / CONTINUE-ON
// ============================================================================

fn set_depends(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.depends else { return };
    match value {
        Value::Sequence(items) if items.is_empty() => step.explicitly_no_deps = true,
        other => match string_or_list(other) {
            Ok(deps) => step.depends = deps,
            Err(e) => ctx.errors.push(format!("{}.depends", prefix), e),
        },
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn int_or_int_list(value: &Value) -> Result<Vec<i64>, BuildError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|i| vec![i])
            .ok_or_else(|| BuildError::InvalidValue("expected an integer".to_string())),
        Value::Sequence(items) => items
            .iter()
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| BuildError::InvalidValue("expected an integer".to_string()))
            })
            .collect(),
        other => Err(BuildError::InvalidValue(format!(
            "expected an integer or a list of integers, got {}",
            value_kind(other)
        ))),
    }
}

/// `"skipped"` / `"failed"` shorthand or the full mapping, strictly typed
/// per field.
fn set_continue_on(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.continue_on else { return };
    match value {
        Value::String(s) => match s.to_lowercase().as_str() {
            "skipped" => step.continue_on.skipped = true,
            "failed" | "failure" => step.continue_on.failure = true,
            other => ctx.errors.push(
                format!("{}.continueOn", prefix),
                BuildError::InvalidValue(format!("unknown continueOn value: {}", other)),
            ),
        },
        Value::Mapping(mapping) => {
            for (k, v) in mapping {
                match k.as_str() {
                    Some("skipped") => match v.as_bool() {
                        Some(b) => step.continue_on.skipped = b,
                        None => ctx.errors.push(
                            format!("{}.continueOn.skipped", prefix),
                            BuildError::InvalidValue(format!(
                                "expected boolean, got {}",
                                value_kind(v)
                            )),
                        ),
                    },
                    Some("failure") => match v.as_bool() {
                        Some(b) => step.continue_on.failure = b,
                        None => ctx.errors.push(
                            format!("{}.continueOn.failure", prefix),
                            BuildError::InvalidValue(format!(
                                "expected boolean, got {}",
                                value_kind(v)
                            )),
                        ),
                    },
                    Some("markSuccess") => match v.as_bool() {
                        Some(b) => step.continue_on.mark_success = b,
                        None => ctx.errors.push(
                            format!("{}.continueOn.markSuccess", prefix),
                            BuildError::InvalidValue(format!(
                                "expected boolean, got {}",
                                value_kind(v)
                            )),
                        ),
                    },
                    Some("exitCode") => match int_or_int_list(v) {
                        Ok(codes) => step.continue_on.exit_code = codes,
                        Err(e) => ctx
                            .errors
                            .push(format!("{}.continueOn.exitCode", prefix), e),
                    },
                    Some("output") => match string_or_list(v) {
                        Ok(outputs) => step.continue_on.output = outputs,
                        Err(_) => ctx.errors.push(
                            format!("{}.continueOn.output", prefix),
                            BuildError::InvalidValue(format!(
                                "expected string or list of strings, got {}",
                                value_kind(v)
                            )),
                        ),
                    },
                    _ => ctx.errors.push(
                        format!("{}.continueOn", prefix),
                        BuildError::InvalidValue(format!(
                            "has invalid keys: {}",
                            k.as_str().unwrap_or("?")
                        )),
                    ),
                }
            }
        }
        other => ctx.errors.push(
            format!("{}.continueOn", prefix),
            BuildError::InvalidValue(format!(
                "continueOn must be a string or a mapping, got {}",
                value_kind(other)
            )),
        ),
    }
}

// ============================================================================
// RETRY / REPEAT POLICIES
// ============================================================================

fn parse_backoff(value: &Value) -> Result<Option<f64>, BuildError> {
    match value {
        Value::Bool(true) => Ok(Some(2.0)),
        Value::Bool(false) => Ok(None),
        Value::Number(n) => {
            let backoff = n.as_f64().unwrap_or_default();
            if backoff <= 1.0 {
                Err(BuildError::InvalidValue(
                    "backoff must be greater than 1.0".to_string(),
                ))
            } else {
                Ok(Some(backoff))
            }
        }
        other => Err(BuildError::InvalidValue(format!(
            "backoff must be a boolean or a number, got {}",
            value_kind(other)
        ))),
    }
}

fn set_retry_policy(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(rp) = &def.retry_policy else { return };
    let field = format!("{}.retryPolicy", prefix);
    let mut policy = RetryPolicy::default();

    match &rp.limit {
        None => ctx.errors.push(
            field.clone(),
            BuildError::InvalidValue("limit is required".to_string()),
        ),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(limit) => policy.limit = limit,
            None => ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue("limit must be non-negative".to_string()),
            ),
        },
        Some(Value::String(s)) => policy.limit_expr = Some(s.clone()),
        Some(other) => ctx.errors.push(
            field.clone(),
            BuildError::InvalidValue(format!(
                "limit must be a number or a string, got {}",
                value_kind(other)
            )),
        ),
    }

    match &rp.interval_sec {
        None => ctx.errors.push(
            field.clone(),
            BuildError::InvalidValue("intervalSec is required".to_string()),
        ),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(interval) => policy.interval_sec = interval,
            None => ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue("intervalSec must be non-negative".to_string()),
            ),
        },
        Some(Value::String(s)) => policy.interval_expr = Some(s.clone()),
        Some(other) => ctx.errors.push(
            field.clone(),
            BuildError::InvalidValue(format!(
                "intervalSec must be a number or a string, got {}",
                value_kind(other)
            )),
        ),
    }

    if let Some(value) = &rp.exit_code {
        match int_or_int_list(value) {
            Ok(codes) => policy.exit_codes = codes,
            Err(e) => ctx.errors.push(format!("{}.exitCode", field), e),
        }
    }
    if let Some(value) = &rp.backoff {
        match parse_backoff(value) {
            Ok(backoff) => policy.backoff = backoff,
            Err(e) => ctx.errors.push(format!("{}.backoff", field), e),
        }
    }
    if let Some(max) = rp.max_interval_sec {
        match u64::try_from(max) {
            Ok(max) => policy.max_interval_sec = Some(max),
            Err(_) => ctx.errors.push(
                format!("{}.maxIntervalSec", field),
                BuildError::InvalidValue("maxIntervalSec must be non-negative".to_string()),
            ),
        }
    }

    step.retry_policy = Some(policy);
}

/// Repeat mode resolution, including the backward-compatible forms:
/// `condition` + `expected` imply `until`; a lone `condition` or
/// `exitCode` implies `while`.
fn set_repeat_policy(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(rp) = &def.repeat_policy else { return };
    let field = format!("{}.repeatPolicy", prefix);

    let condition = rp.condition.as_ref().map(|condition| Condition {
        condition: condition.clone(),
        expected: rp.expected.clone().unwrap_or_default(),
    });
    let exit_codes = match &rp.exit_code {
        None => Vec::new(),
        Some(value) => match int_or_int_list(value) {
            Ok(codes) => codes,
            Err(e) => {
                ctx.errors.push(format!("{}.exitCode", field), e);
                Vec::new()
            }
        },
    };

    let has_trigger = condition.is_some() || !exit_codes.is_empty();
    let mode = match &rp.repeat {
        None => {
            if condition.as_ref().is_some_and(|c| !c.expected.is_empty()) {
                Some(RepeatMode::Until)
            } else if has_trigger {
                Some(RepeatMode::While)
            } else {
                None
            }
        }
        Some(Value::Bool(true)) => Some(RepeatMode::While),
        Some(Value::Bool(false)) => return,
        Some(Value::String(s)) => {
            let explicit = match s.as_str() {
                "while" => Some(RepeatMode::While),
                "until" => Some(RepeatMode::Until),
                other => {
                    ctx.errors.push(
                        field.clone(),
                        BuildError::InvalidValue(format!(
                            "repeat must be a boolean, \"while\", or \"until\", got {}",
                            other
                        )),
                    );
                    None
                }
            };
            if explicit.is_some() && !has_trigger {
                ctx.errors.push(
                    field.clone(),
                    BuildError::InvalidValue(
                        "explicit while/until requires condition or exitCode".to_string(),
                    ),
                );
            }
            explicit
        }
        Some(other) => {
            ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue(format!(
                    "repeat must be a boolean or a string, got {}",
                    value_kind(other)
                )),
            );
            None
        }
    };

    let backoff = match &rp.backoff {
        None => None,
        Some(value) => match parse_backoff(value) {
            Ok(backoff) => backoff,
            Err(e) => {
                ctx.errors.push(format!("{}.backoff", field), e);
                None
            }
        },
    };

    let to_u64 = |v: Option<i64>, what: &str, ctx: &mut BuildContext| -> Option<u64> {
        v.and_then(|v| match u64::try_from(v) {
            Ok(v) => Some(v),
            Err(_) => {
                ctx.errors.push(
                    field.clone(),
                    BuildError::InvalidValue(format!("{} must be non-negative", what)),
                );
                None
            }
        })
    };
    let interval_sec = to_u64(rp.interval_sec, "intervalSec", ctx);
    let limit = to_u64(rp.limit, "limit", ctx);
    let max_interval_sec = to_u64(rp.max_interval_sec, "maxIntervalSec", ctx);

    step.repeat_policy = Some(RepeatPolicy {
        mode,
        interval_sec,
        limit,
        condition,
        exit_codes,
        backoff,
        max_interval_sec,
    });
}

// ============================================================================
// SIGNALS / TIMEOUT / PRECONDITIONS / ENV
// ============================================================================

fn set_signal_on_stop(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(signal) = &def.signal_on_stop else { return };
    if signal.is_empty() {
        return;
    }
    if SIGNALS.contains(&signal.as_str()) {
        step.signal_on_stop = Some(signal.clone());
    } else {
        ctx.errors.push(
            format!("{}.signalOnStop", prefix),
            BuildError::InvalidSignal(signal.clone()),
        );
    }
}

fn set_timeout(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(timeout) = def.timeout_sec else { return };
    match u64::try_from(timeout) {
        Ok(timeout) => step.timeout_sec = Some(timeout),
        Err(_) => ctx.errors.push(
            format!("{}.timeoutSec", prefix),
            BuildError::TimeoutMustBeNonNegative,
        ),
    }
}

fn set_step_preconditions(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.preconditions else { return };
    match parse_conditions(value) {
        Ok(conditions) => step.preconditions = conditions,
        Err(e) => ctx.errors.push(format!("{}.preconditions", prefix), e),
    }
}

/// Step env layers over the DAG scope for its own expansion but is stored
/// separately; the runtime layers it on top again, step winning.
fn set_step_env(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.env else { return };
    let pairs = match super::dag::key_value_pairs(value) {
        Ok(pairs) => pairs,
        Err(e) => {
            ctx.errors.push(
                format!("{}.env", prefix),
                BuildError::InvalidEnvValue(e.to_string()),
            );
            return;
        }
    };

    let mut scope = ctx.scope.clone();
    for (key, raw) in pairs {
        let evaluator = Evaluator::new(&scope)
            .with_shell(&ctx.shell, &ctx.shell_args)
            .no_eval(ctx.opts.no_eval);
        match evaluator.eval(&raw) {
            Ok(value) => {
                scope.set(key.clone(), value.clone());
                step.env.retain(|existing| existing.key != key);
                step.env.push(EnvVar::new(key, value));
            }
            Err(e) => ctx.errors.push(
                format!("{}.env", prefix),
                BuildError::InvalidEnvValue(format!("{}: {}", key, e)),
            ),
        }
    }
}

fn set_step_container(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(container) = &def.container else { return };
    match build_container(ctx, container) {
        Ok(config) => step.container = Some(config),
        Err(e) => ctx.errors.push(format!("{}.container", prefix), e),
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

fn yaml_config_map(value: &Value) -> Result<IndexMap<String, serde_json::Value>, BuildError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| BuildError::InvalidValue("config must be a mapping".to_string()))?;
    let mut config = IndexMap::new();
    for (k, v) in mapping {
        let key = k
            .as_str()
            .ok_or_else(|| BuildError::InvalidValue("config keys must be strings".to_string()))?;
        let json = serde_json::to_value(v)
            .map_err(|e| BuildError::InvalidValue(format!("config {}: {}", key, e)))?;
        config.insert(key.to_string(), json);
    }
    Ok(config)
}

/// Explicit `executor:` / `type:` wins; otherwise the type is inferred
/// from the step shape, then from DAG-level container/SSH settings.
fn set_executor(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step, dag: &Dag) {
    let field = format!("{}.executor", prefix);
    let mut executor = ExecutorConfig::default();

    if def.executor.is_some() && def.step_type.is_some() {
        ctx.errors.push(
            field.clone(),
            BuildError::InvalidValue("executor and type are mutually exclusive".to_string()),
        );
    }

    match &def.executor {
        None => {
            if let Some(t) = &def.step_type {
                executor.executor_type = t.clone();
            }
        }
        Some(Value::String(s)) => executor.executor_type = s.clone(),
        Some(Value::Mapping(mapping)) => {
            for (k, v) in mapping {
                match k.as_str() {
                    Some("type") => match v.as_str() {
                        Some(t) => executor.executor_type = t.to_string(),
                        None => ctx.errors.push(
                            field.clone(),
                            BuildError::InvalidValue("executor type must be a string".to_string()),
                        ),
                    },
                    Some("config") => match yaml_config_map(v) {
                        Ok(config) => executor.config = config,
                        Err(e) => ctx.errors.push(field.clone(), e),
                    },
                    _ => ctx.errors.push(
                        field.clone(),
                        BuildError::InvalidValue(
                            "executor may contain only type and config".to_string(),
                        ),
                    ),
                }
            }
        }
        Some(other) => ctx.errors.push(
            field.clone(),
            BuildError::InvalidValue(format!(
                "executor must be a string or a mapping, got {}",
                value_kind(other)
            )),
        ),
    }

    // Top-level `config` shorthand merges over executor-provided config.
    if let Some(value) = &def.config {
        match yaml_config_map(value) {
            Ok(config) => executor.config.extend(config),
            Err(e) => ctx.errors.push(format!("{}.config", prefix), e),
        }
    }

    if executor.executor_type.is_empty() {
        executor.executor_type = infer_executor_type(def, step, dag);
    }

    step.executor = executor;
}

fn infer_executor_type(def: &StepDef, step: &Step, dag: &Dag) -> String {
    if def.call.is_some() || def.run.is_some() {
        "dag"
    } else if def.parallel.is_some() {
        "parallel"
    } else if step.container.is_some() {
        "docker"
    } else if def.llm.is_some() || def.messages.is_some() {
        "chat"
    } else if def.agent.is_some() {
        "agent"
    } else if def.value.is_some() || def.routes.is_some() {
        "router"
    } else if dag.container.is_some() {
        "container"
    } else if dag.ssh.is_some() {
        "ssh"
    } else {
        ""
    }
    .to_string()
}

// ============================================================================
// PARALLEL / SUB-DAG
// ============================================================================

fn parse_parallel_item(value: &Value) -> Result<ParallelItem, BuildError> {
    match value {
        Value::Mapping(mapping) => {
            let mut item = IndexMap::new();
            for (k, v) in mapping {
                let key = k.as_str().ok_or_else(|| {
                    BuildError::InvalidValue("parallel item keys must be strings".to_string())
                })?;
                let val = scalar_to_string(v).ok_or_else(|| {
                    BuildError::InvalidValue(
                        "parallel item values must be scalars; nested structures are not supported"
                            .to_string(),
                    )
                })?;
                item.insert(key.to_string(), val);
            }
            Ok(ParallelItem::Params(item))
        }
        other => scalar_to_string(other)
            .map(ParallelItem::Value)
            .ok_or_else(|| {
                BuildError::InvalidValue(
                    "parallel items must be scalars or mappings".to_string(),
                )
            }),
    }
}

/// `${VAR}` reference, static item list, or `{items, maxConcurrent}`.
fn set_parallel(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.parallel else { return };
    let field = format!("{}.parallel", prefix);
    let mut parallel = ParallelConfig::default();

    let parse_items = |value: &Value, ctx: &mut BuildContext, parallel: &mut ParallelConfig| {
        match value {
            Value::String(s) if s.starts_with("${") && s.ends_with('}') => {
                parallel.source_var = Some(s.clone());
            }
            Value::String(s) => ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue(format!(
                    "parallel variable reference must look like ${{ITEMS}}, got {}",
                    s
                )),
            ),
            Value::Sequence(items) => {
                for item in items {
                    match parse_parallel_item(item) {
                        Ok(item) => parallel.items.push(item),
                        Err(e) => ctx.errors.push(field.clone(), e),
                    }
                }
            }
            other => ctx.errors.push(
                field.clone(),
                BuildError::InvalidValue(format!(
                    "parallel must be a variable reference, a list, or a mapping, got {}",
                    value_kind(other)
                )),
            ),
        }
    };

    match value {
        Value::Mapping(mapping) => {
            for (k, v) in mapping {
                match k.as_str() {
                    Some("items") => parse_items(v, ctx, &mut parallel),
                    Some("maxConcurrent") => match v.as_u64() {
                        Some(max) if max >= 1 => parallel.max_concurrent = max as usize,
                        _ => ctx.errors.push(
                            format!("{}.maxConcurrent", field),
                            BuildError::InvalidValue(
                                "maxConcurrent must be a positive integer".to_string(),
                            ),
                        ),
                    },
                    _ => ctx.errors.push(
                        field.clone(),
                        BuildError::InvalidValue(
                            "parallel may contain only items and maxConcurrent".to_string(),
                        ),
                    ),
                }
            }
            if parallel.items.is_empty() && parallel.source_var.is_none() {
                ctx.errors.push(
                    field.clone(),
                    BuildError::InvalidValue("parallel requires items".to_string()),
                );
            }
        }
        other => parse_items(other, ctx, &mut parallel),
    }

    step.parallel = Some(parallel);
}

fn set_sub_dag(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    if def.run.is_some() {
        ctx.warn(format!("{}: run is deprecated; use call", step.name));
    }
    let name = match (&def.call, &def.run) {
        (None, None) => return,
        (Some(call), Some(_)) => {
            ctx.errors.push(
                format!("{}.call", prefix),
                BuildError::InvalidValue("call and run are mutually exclusive".to_string()),
            );
            call.clone()
        }
        (Some(call), None) => call.clone(),
        (None, Some(run)) => run.clone(),
    };

    let params = match &def.params {
        None => String::new(),
        Some(value) => match params::parse_step_params(ctx, value) {
            Ok(params) => params::stringify_params(&params),
            Err(e) => {
                ctx.errors.push(format!("{}.params", prefix), e);
                String::new()
            }
        },
    };

    step.sub_dag = Some(SubDag { name, params });
}

/// Structured params pass-through for non-DAG executors.
fn set_step_params(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    if step.sub_dag.is_some() {
        return;
    }
    let Some(value) = &def.params else { return };
    match params::parse_step_params(ctx, value) {
        Ok(params) => step.params = Some(params::stringify_params(&params)),
        Err(e) => ctx.errors.push(format!("{}.params", prefix), e),
    }
}

// ============================================================================
// LLM / MESSAGES / AGENT / ROUTER
// ============================================================================

fn parse_model(value: &Value) -> Result<ModelRef, BuildError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(ModelRef::Name(s.clone())),
        Value::Mapping(mapping) => {
            let mut provider = None;
            let mut name = None;
            for (k, v) in mapping {
                match k.as_str() {
                    Some("provider") => provider = v.as_str().map(str::to_string),
                    Some("name") => name = v.as_str().map(str::to_string),
                    _ => {
                        return Err(BuildError::InvalidValue(
                            "model may contain only provider and name".to_string(),
                        ))
                    }
                }
            }
            match (provider, name) {
                (Some(provider), Some(name)) => Ok(ModelRef::Spec { provider, name }),
                _ => Err(BuildError::InvalidValue(
                    "model mapping requires provider and name".to_string(),
                )),
            }
        }
        _ => Err(BuildError::InvalidValue(
            "model must be a string or a {provider, name} mapping".to_string(),
        )),
    }
}

fn set_llm(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(llm) = &def.llm else { return };
    let field = format!("{}.llm", prefix);
    let mut config = LlmConfig::default();
    llm_into_config(ctx, llm, &field, &mut config);
    step.llm = Some(config);
}

fn llm_into_config(ctx: &mut BuildContext, llm: &LlmDef, field: &str, config: &mut LlmConfig) {
    match &llm.model {
        None => ctx.errors.push(
            format!("{}.model", field),
            BuildError::InvalidValue("model is required".to_string()),
        ),
        Some(value) => match parse_model(value) {
            Ok(model) => config.model = model,
            Err(e) => ctx.errors.push(format!("{}.model", field), e),
        },
    }
    if let Some(temperature) = llm.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            ctx.errors.push(
                format!("{}.temperature", field),
                BuildError::InvalidValue("temperature must be between 0.0 and 2.0".to_string()),
            );
        } else {
            config.temperature = Some(temperature);
        }
    }
    if let Some(top_p) = llm.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            ctx.errors.push(
                format!("{}.topP", field),
                BuildError::InvalidValue("topP must be between 0.0 and 1.0".to_string()),
            );
        } else {
            config.top_p = Some(top_p);
        }
    }
    if let Some(max_tokens) = llm.max_tokens {
        if max_tokens < 1 {
            ctx.errors.push(
                format!("{}.maxTokens", field),
                BuildError::InvalidValue("maxTokens must be at least 1".to_string()),
            );
        } else {
            config.max_tokens = Some(max_tokens as u64);
        }
    }
    config.system_prompt = llm.system_prompt.clone();
    config.prompt = llm.prompt.clone();
}

fn set_messages(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(value) = &def.messages else { return };
    let field = format!("{}.messages", prefix);
    let Some(items) = value.as_sequence() else {
        ctx.errors.push(
            field,
            BuildError::InvalidValue("messages must be a list".to_string()),
        );
        return;
    };
    if items.is_empty() {
        ctx.errors.push(
            field,
            BuildError::InvalidValue("messages must contain at least one message".to_string()),
        );
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let item_field = format!("{}[{}]", field, i);
        let Some(mapping) = item.as_mapping() else {
            ctx.errors.push(
                item_field,
                BuildError::InvalidValue("message must be a mapping".to_string()),
            );
            continue;
        };
        let mut message = Message::default();
        for (k, v) in mapping {
            match k.as_str() {
                Some("role") => message.role = v.as_str().unwrap_or_default().to_string(),
                Some("content") => {
                    message.content = scalar_to_string(v).unwrap_or_default();
                }
                _ => ctx.errors.push(
                    item_field.clone(),
                    BuildError::InvalidValue(
                        "message may contain only role and content".to_string(),
                    ),
                ),
            }
        }
        if message.role.is_empty() || message.content.is_empty() {
            ctx.errors.push(
                item_field,
                BuildError::InvalidValue("message requires role and content".to_string()),
            );
            continue;
        }
        step.messages.push(message);
    }
}

fn set_agent(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    let Some(agent) = &def.agent else { return };
    let mut config = AgentConfig {
        tools: agent.tools.clone().unwrap_or_default(),
        prompt: agent.prompt.clone(),
        ..Default::default()
    };
    if let Some(max_iterations) = agent.max_iterations {
        if max_iterations < 1 {
            ctx.errors.push(
                format!("{}.agent.maxIterations", prefix),
                BuildError::InvalidValue("maxIterations must be at least 1".to_string()),
            );
        } else {
            config.max_iterations = Some(max_iterations as u64);
        }
    }
    step.agent = Some(config);
}

fn parse_route(pattern: &str, targets: &Value) -> Result<Route, BuildError> {
    if pattern.is_empty() {
        return Err(BuildError::InvalidValue(
            "route pattern must not be empty".to_string(),
        ));
    }
    let targets: Vec<String> = string_or_list(targets)?
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect();
    if targets.is_empty() {
        return Err(BuildError::InvalidValue(format!(
            "route {} requires at least one target",
            pattern
        )));
    }
    Ok(Route {
        pattern: pattern.to_string(),
        targets,
    })
}

/// Routes normalize to a list ordered exact-first, then `re:` regexes,
/// with the `re:.*` catch-all last. Completeness (non-empty value, at
/// least one route) is enforced by the cross-field validator.
fn set_router(ctx: &mut BuildContext, def: &StepDef, prefix: &str, step: &mut Step) {
    if def.value.is_none() && def.routes.is_none() {
        return;
    }
    let field = format!("{}.routes", prefix);

    let value = def.value.clone().unwrap_or_default();

    let mut routes: Vec<Route> = Vec::new();
    match &def.routes {
        None => {}
        Some(Value::Mapping(mapping)) => {
            for (k, v) in mapping {
                match k.as_str() {
                    Some(pattern) => match parse_route(pattern, v) {
                        Ok(route) => routes.push(route),
                        Err(e) => ctx.errors.push(field.clone(), e),
                    },
                    None => ctx.errors.push(
                        field.clone(),
                        BuildError::InvalidValue("route patterns must be strings".to_string()),
                    ),
                }
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items {
                let Some(mapping) = item.as_mapping() else {
                    ctx.errors.push(
                        field.clone(),
                        BuildError::InvalidValue("route must be a mapping".to_string()),
                    );
                    continue;
                };
                let pattern = mapping
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let targets = mapping
                    .get("targets")
                    .cloned()
                    .unwrap_or(Value::Sequence(Vec::new()));
                match parse_route(pattern, &targets) {
                    Ok(route) => routes.push(route),
                    Err(e) => ctx.errors.push(field.clone(), e),
                }
            }
        }
        Some(other) => ctx.errors.push(
            field,
            BuildError::InvalidValue(format!(
                "routes must be a mapping or a list, got {}",
                value_kind(other)
            )),
        ),
    }

    routes.sort_by_key(Route::kind);
    step.router = Some(RouterConfig { value, routes });
}

// ============================================================================
// EMPTY-STEP CHECK
// ============================================================================

/// A shell-family step with nothing to execute is an error; executors
/// driven purely by config (http, mail, ...) are exempt.
fn check_actionable(ctx: &mut BuildContext, prefix: &str, step: &Step) {
    let shell_family = matches!(
        step.executor.executor_type.as_str(),
        "" | "shell" | "docker" | "container" | "ssh"
    );
    if shell_family
        && step.commands.is_empty()
        && step.script.is_none()
        && step.sub_dag.is_none()
        && step.parallel.is_none()
        && step.llm.is_none()
        && step.messages.is_empty()
        && step.agent.is_none()
        && step.router.is_none()
        && step.executor.config.is_empty()
    {
        ctx.errors
            .push(format!("{}.command", prefix), BuildError::StepCommandIsEmpty);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{build_dag, BuildOpts};
    use crate::dag::Dag;
    use crate::def::DagDef;
    use crate::step::{LogOutput, ParallelItem, RepeatMode, RouteKind};

    fn build(yaml: &str) -> Dag {
        let def: DagDef = serde_yaml::from_str(yaml).unwrap();
        build_dag(&def, &BuildOpts::new(), None).unwrap()
    }

    fn build_err(yaml: &str) -> String {
        let def: DagDef = serde_yaml::from_str(yaml).unwrap();
        build_dag(&def, &BuildOpts::new(), None)
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn test_scalar_steps_auto_named() {
        let dag = build("steps:\n  - echo a\n  - echo b\n  - echo c\n");
        let names: Vec<&str> = dag.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cmd_1", "cmd_2", "cmd_3"]);
    }

    #[test]
    fn test_auto_name_skips_explicit_collisions() {
        let dag = build(
            r#"
steps:
  - echo a
  - name: cmd_2
    command: echo named
  - echo c
"#,
        );
        let names: Vec<&str> = dag.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cmd_1", "cmd_2", "cmd_3"]);
        // the third step is auto-named: ordinal 3 is free because the
        // explicit cmd_2 was registered up front
        assert_eq!(dag.steps[2].commands[0].command, "echo");
    }

    #[test]
    fn test_kind_from_shape() {
        let dag = build(
            r#"
steps:
  - script: |
      echo line1
      echo line2
  - call: child
  - executor: http
    config:
      url: https://example.com
"#,
        );
        let names: Vec<&str> = dag.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["script_1", "dag_2", "http_3"]);
    }

    #[test]
    fn test_command_string_splits_on_shell_grammar() {
        let dag = build("steps:\n  - command: echo \"hello world\"\n");
        let cmd = &dag.steps[0].commands[0];
        assert_eq!(cmd.command, "echo");
        assert_eq!(cmd.args, vec!["hello world".to_string()]);
        assert_eq!(cmd.cmd_with_args, "echo \"hello world\"");
    }

    #[test]
    fn test_multiline_command_becomes_script() {
        let dag = build("steps:\n  - command: |\n      echo one\n      echo two\n");
        assert!(dag.steps[0].commands.is_empty());
        assert!(dag.steps[0].script.as_ref().unwrap().contains("echo two"));
    }

    #[test]
    fn test_argv_form() {
        let dag = build("steps:\n  - command:\n      - [jq, \".items\", file.json]\n");
        let cmd = &dag.steps[0].commands[0];
        assert_eq!(cmd.command, "jq");
        assert_eq!(cmd.args, vec![".items".to_string(), "file.json".to_string()]);
    }

    #[test]
    fn test_empty_command_is_error() {
        let err = build_err("steps:\n  - command: \"\"\n");
        assert!(err.contains("step command is empty"));
    }

    #[test]
    fn test_id_rules() {
        let err = build_err("steps:\n  - name: a\n    id: 9bad\n    command: echo hi\n");
        assert!(err.contains("invalid step id"));

        let err = build_err("steps:\n  - name: a\n    id: steps\n    command: echo hi\n");
        assert!(err.contains("reserved word"));
    }

    #[test]
    fn test_depends_forms() {
        let dag = build(
            r#"
type: graph
steps:
  - name: a
    command: echo a
  - name: b
    command: echo b
    depends: a
  - name: c
    command: echo c
    depends: [a, b]
"#,
        );
        assert_eq!(dag.steps[1].depends, vec!["a".to_string()]);
        assert_eq!(dag.steps[2].depends.len(), 2);
    }

    #[test]
    fn test_explicit_empty_depends_opts_out() {
        let dag = build(
            r#"
steps:
  - name: a
    command: echo a
  - name: b
    command: echo b
    depends: []
"#,
        );
        assert!(dag.steps[1].explicitly_no_deps);
        assert!(dag.steps[1].depends.is_empty());
    }

    #[test]
    fn test_continue_on_string_forms() {
        let dag = build("steps:\n  - command: echo a\n    continueOn: SKIPPED\n");
        assert!(dag.steps[0].continue_on.skipped);

        let dag = build("steps:\n  - command: echo a\n    continueOn: failed\n");
        assert!(dag.steps[0].continue_on.failure);
    }

    #[test]
    fn test_continue_on_type_errors() {
        let err = build_err(
            "steps:\n  - command: echo a\n    continueOn:\n      failure: \"yes\"\n",
        );
        assert!(err.contains("continueOn.failure: expected boolean, got string"));
    }

    #[test]
    fn test_retry_policy_requirements_and_backoff() {
        let err = build_err(
            "steps:\n  - command: echo a\n    retryPolicy:\n      intervalSec: 1\n",
        );
        assert!(err.contains("limit is required"));

        let err = build_err(
            "steps:\n  - command: echo a\n    retryPolicy:\n      limit: 3\n      intervalSec: 1\n      backoff: 0.8\n",
        );
        assert!(err.contains("backoff must be greater than 1.0"));
    }

    #[test]
    fn test_retry_policy_string_forms_deferred() {
        let dag = build(
            "steps:\n  - command: echo a\n    retryPolicy:\n      limit: \"${LIMIT}\"\n      intervalSec: \"${IVL}\"\n",
        );
        let policy = dag.steps[0].retry_policy.as_ref().unwrap();
        assert_eq!(policy.limit_expr.as_deref(), Some("${LIMIT}"));
        assert_eq!(policy.interval_expr.as_deref(), Some("${IVL}"));
    }

    #[test]
    fn test_repeat_backward_compatibility() {
        let dag = build(
            "steps:\n  - command: echo a\n    repeatPolicy:\n      condition: \"`status`\"\n      expected: done\n",
        );
        let policy = dag.steps[0].repeat_policy.as_ref().unwrap();
        assert_eq!(policy.mode, Some(RepeatMode::Until));

        let dag = build(
            "steps:\n  - command: echo a\n    repeatPolicy:\n      exitCode: [1]\n",
        );
        let policy = dag.steps[0].repeat_policy.as_ref().unwrap();
        assert_eq!(policy.mode, Some(RepeatMode::While));
    }

    #[test]
    fn test_repeat_boolean_and_explicit_modes() {
        let dag = build("steps:\n  - command: echo a\n    repeatPolicy:\n      repeat: true\n      intervalSec: 5\n");
        let policy = dag.steps[0].repeat_policy.as_ref().unwrap();
        assert_eq!(policy.mode, Some(RepeatMode::While));
        assert!(policy.condition.is_none());

        let err = build_err(
            "steps:\n  - command: echo a\n    repeatPolicy:\n      repeat: while\n",
        );
        assert!(err.contains("requires condition or exitCode"));
    }

    #[test]
    fn test_executor_inference_from_shapes() {
        let dag = build(
            r#"
steps:
  - call: child
  - command: echo x
    parallel:
      - a
      - b
  - command: echo y
    container:
      image: alpine:3
"#,
        );
        assert_eq!(dag.steps[0].executor.executor_type, "dag");
        assert_eq!(dag.steps[1].executor.executor_type, "parallel");
        assert_eq!(dag.steps[2].executor.executor_type, "docker");
    }

    #[test]
    fn test_dag_container_inference_and_explicit_override() {
        let yaml = r#"
container:
  image: python:3.11
steps:
  - command: echo a
  - command: echo b
    executor: shell
"#;
        let dag = build(yaml);
        assert_eq!(dag.steps[0].executor.executor_type, "container");
        assert_eq!(dag.steps[1].executor.executor_type, "shell");
    }

    #[test]
    fn test_dag_ssh_inference() {
        let dag = build("ssh:\n  host: example.com\nsteps:\n  - command: echo a\n");
        assert_eq!(dag.steps[0].executor.executor_type, "ssh");
    }

    #[test]
    fn test_parallel_forms() {
        let dag = build(
            r#"
steps:
  - call: child
    parallel: ${ITEMS}
  - call: child
    parallel:
      - one
      - two
  - call: child
    parallel:
      items:
        - REGION: eu
          BUCKET: b1
      maxConcurrent: 2
"#,
        );
        assert_eq!(
            dag.steps[0].parallel.as_ref().unwrap().source_var.as_deref(),
            Some("${ITEMS}")
        );
        assert_eq!(dag.steps[1].parallel.as_ref().unwrap().items.len(), 2);
        let third = dag.steps[2].parallel.as_ref().unwrap();
        assert_eq!(third.max_concurrent, 2);
        assert!(matches!(third.items[0], ParallelItem::Params(_)));
    }

    #[test]
    fn test_parallel_default_max_concurrent() {
        let dag = build("steps:\n  - call: child\n    parallel:\n      - a\n");
        assert_eq!(dag.steps[0].parallel.as_ref().unwrap().max_concurrent, 8);
    }

    #[test]
    fn test_parallel_nested_items_rejected() {
        let err = build_err(
            "steps:\n  - call: child\n    parallel:\n      - KEY:\n          nested: true\n",
        );
        assert!(err.contains("nested structures are not supported"));
    }

    #[test]
    fn test_sub_dag_params_stringified() {
        let dag = build(
            r#"
steps:
  - call: child
    params: "P1=alpha beta"
"#,
        );
        let sub = dag.steps[0].sub_dag.as_ref().unwrap();
        assert_eq!(sub.name, "child");
        assert_eq!(sub.params, "P1=\"alpha\" beta");
    }

    #[test]
    fn test_run_alias_warns() {
        let def: DagDef = serde_yaml::from_str("steps:\n  - run: child\n").unwrap();
        let dag = build_dag(&def, &BuildOpts::new(), None).unwrap();
        assert_eq!(dag.steps[0].sub_dag.as_ref().unwrap().name, "child");
        assert!(dag.build_warnings.iter().any(|w| w.contains("deprecated")));
    }

    #[test]
    fn test_llm_validation() {
        let err = build_err(
            "steps:\n  - llm:\n      model: gpt-x\n      temperature: 3.0\n",
        );
        assert!(err.contains("temperature must be between 0.0 and 2.0"));

        let err = build_err("steps:\n  - llm:\n      temperature: 1.0\n");
        assert!(err.contains("model is required"));
    }

    #[test]
    fn test_messages_require_content() {
        let err = build_err("steps:\n  - llm:\n      model: m\n    messages: []\n");
        assert!(err.contains("at least one message"));

        let dag = build(
            "steps:\n  - llm:\n      model: m\n    messages:\n      - role: user\n        content: hi\n",
        );
        assert_eq!(dag.steps[0].messages.len(), 1);
        assert_eq!(dag.steps[0].executor.executor_type, "chat");
    }

    #[test]
    fn test_router_routes_sorted() {
        let dag = build(
            r#"
steps:
  - name: route
    type: router
    value: ${KIND}
    routes:
      "re:.*": fallback
      "re:v[0-9]+": tagger
      exact: handler
"#,
        );
        let router = dag.steps[0].router.as_ref().unwrap();
        let kinds: Vec<RouteKind> = router.routes.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![RouteKind::Exact, RouteKind::Regex, RouteKind::CatchAll]
        );
        assert_eq!(dag.steps[0].executor.executor_type, "router");
    }

    #[test]
    fn test_router_requires_value_and_routes() {
        let err = build_err("steps:\n  - name: r\n    value: ${X}\n");
        assert!(err.contains("router requires at least one route"));

        let err = build_err("steps:\n  - name: r\n    routes:\n      a: b\n");
        assert!(err.contains("router requires a value"));
    }

    #[test]
    fn test_signal_on_stop() {
        let dag = build("steps:\n  - command: sleep 10\n    signalOnStop: SIGINT\n");
        assert_eq!(dag.steps[0].signal_on_stop.as_deref(), Some("SIGINT"));

        let err = build_err("steps:\n  - command: sleep 10\n    signalOnStop: SIGWAT\n");
        assert!(err.contains("invalid signal: SIGWAT"));
    }

    #[test]
    fn test_timeout_must_be_non_negative() {
        let err = build_err("steps:\n  - command: echo a\n    timeoutSec: -1\n");
        assert!(err.contains("timeoutSec must be non-negative"));
    }

    #[test]
    fn test_step_env_layers_over_dag_env() {
        let dag = build(
            r#"
env:
  - BASE: root
steps:
  - command: echo hi
    env:
      - DERIVED: ${BASE}-step
"#,
        );
        assert_eq!(dag.steps[0].env[0].value, "root-step");
        // step env stays off the DAG list
        assert_eq!(dag.env.len(), 1);
    }

    #[test]
    fn test_output_forms() {
        let dag = build("steps:\n  - command: echo a\n    output: $RESULT\n");
        assert_eq!(dag.steps[0].output.as_ref().unwrap().name, "RESULT");

        let dag = build(
            "steps:\n  - command: echo a\n    output:\n      name: RESULT\n      key: items.0\n      omit: true\n",
        );
        let output = dag.steps[0].output.as_ref().unwrap();
        assert_eq!(output.key.as_deref(), Some("items.0"));
        assert!(output.omit);
    }

    #[test]
    fn test_log_output_values() {
        let dag = build("steps:\n  - command: echo a\n    logOutput: merged\n");
        assert_eq!(dag.steps[0].log_output, Some(LogOutput::Merged));

        let err = build_err("steps:\n  - command: echo a\n    logOutput: sideways\n");
        assert!(err.contains("logOutput must be separate or merged"));
    }

    #[test]
    fn test_working_dir_wins_over_dir() {
        let dag = build("steps:\n  - command: echo a\n    dir: /a\n    workingDir: /b\n");
        assert_eq!(dag.steps[0].dir, "/b");
    }
}
