//! # DAG Field Transformers
//!
//! One function per DAG-level field, in the order declared by the
//! pipeline in [`crate::builder`]. Each writes a single field of the
//! output DAG and returns at most one error, which the driver tags with
//! the field name.

use std::path::PathBuf;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;

use crate::dag::{
    Condition, ContainerConfig, Dag, DagType, EnvVar, MailConfig, OtelConfig, PullPolicy,
    RegistryAuth, Schedule, Secret, SmtpConfig, SshConfig, DEFAULT_HIST_RETENTION_DAYS,
    DEFAULT_MAX_ACTIVE_RUNS, DEFAULT_MAX_CLEANUP_TIME_SEC,
};
use crate::def::{ContainerDef, DagDef, SecretDef};
use crate::errors::BuildError;

use super::step::build_handler_step;
use super::BuildContext;

// ============================================================================
// VALUE HELPERS (shared with the step transformers)
// ============================================================================

/// Render a YAML scalar as a string.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Accept a scalar or a sequence of scalars.
pub(crate) fn string_or_list(value: &Value) -> Result<Vec<String>, BuildError> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                scalar_to_string(item).ok_or_else(|| {
                    BuildError::InvalidValue("expected a string or a list of strings".to_string())
                })
            })
            .collect(),
        other => scalar_to_string(other).map(|s| vec![s]).ok_or_else(|| {
            BuildError::InvalidValue("expected a string or a list of strings".to_string())
        }),
    }
}

/// Ordered `(key, value)` pairs from a mapping or a sequence of mappings.
pub(crate) fn key_value_pairs(value: &Value) -> Result<Vec<(String, String)>, BuildError> {
    let mut pairs = Vec::new();
    let mut push_mapping = |mapping: &serde_yaml::Mapping| -> Result<(), BuildError> {
        for (k, v) in mapping {
            let key = k
                .as_str()
                .ok_or_else(|| BuildError::InvalidValue("keys must be strings".to_string()))?;
            let val = scalar_to_string(v).ok_or_else(|| {
                BuildError::InvalidValue(format!("value for {} must be a scalar", key))
            })?;
            pairs.push((key.to_string(), val));
        }
        Ok(())
    };

    match value {
        Value::Mapping(mapping) => push_mapping(mapping)?,
        Value::Sequence(items) => {
            for item in items {
                let mapping = item.as_mapping().ok_or_else(|| {
                    BuildError::InvalidValue(
                        "expected a mapping or a list of single-key mappings".to_string(),
                    )
                })?;
                push_mapping(mapping)?;
            }
        }
        _ => {
            return Err(BuildError::InvalidValue(
                "expected a mapping or a list of single-key mappings".to_string(),
            ))
        }
    }
    Ok(pairs)
}

/// Numeric or string port.
fn port_string(value: &Value) -> Result<String, BuildError> {
    scalar_to_string(value)
        .ok_or_else(|| BuildError::InvalidValue("port must be a number or a string".to_string()))
}

fn non_negative(value: i64, what: &str) -> Result<u64, BuildError> {
    u64::try_from(value)
        .map_err(|_| BuildError::InvalidValue(format!("{} must be non-negative", what)))
}

// ============================================================================
// IDENTITY
// ============================================================================

pub(crate) fn set_name(ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    dag.name = def
        .name
        .clone()
        .or_else(|| ctx.opts.name.clone())
        .or_else(|| {
            ctx.location
                .as_ref()
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    Ok(())
}

pub(crate) fn set_description(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.description = def.description.clone().unwrap_or_default();
    Ok(())
}

/// Comma-separated string or sequence; tags are trimmed.
pub(crate) fn set_tags(_ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(value) = &def.tags else { return Ok(()) };
    let raw = match value {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        other => string_or_list(other)?,
    };
    dag.tags = raw
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(())
}

// ============================================================================
// WORKING DIR / SHELL / ENV / DOTENV
// ============================================================================

pub(crate) fn set_working_dir(
    ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let base_dir = ctx
        .opts
        .default_working_dir
        .clone()
        .or_else(|| {
            ctx.location
                .as_ref()
                .and_then(|p| p.parent())
                .map(PathBuf::from)
        })
        .or_else(|| ctx.opts.dags_dir.clone())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    dag.working_dir = match &def.working_dir {
        None => base_dir,
        Some(raw) => {
            let expanded = ctx
                .evaluator()
                .eval(raw)
                .map_err(|e| BuildError::InvalidValue(e.to_string()))?;
            let path = PathBuf::from(expanded);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        }
    };
    Ok(())
}

pub(crate) fn set_log_dir(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.log_dir = def.log_dir.clone().unwrap_or_default();
    Ok(())
}

/// `"bash -e"` or `[bash, -e]`; first token is the shell, the rest args.
/// Empty falls back to `$SHELL`, then `sh`.
pub(crate) fn parse_shell(
    ctx: &BuildContext,
    value: Option<&Value>,
) -> Result<Option<(String, Vec<String>)>, BuildError> {
    let Some(value) = value else { return Ok(None) };
    let tokens = match value {
        Value::String(s) => {
            let expanded = ctx
                .evaluator()
                .eval(s)
                .map_err(|e| BuildError::InvalidValue(e.to_string()))?;
            shell_words::split(&expanded)
                .map_err(|e| BuildError::InvalidValue(format!("invalid shell: {}", e)))?
        }
        other => string_or_list(other)?,
    };
    let mut iter = tokens.into_iter();
    match iter.next() {
        None => Ok(None),
        Some(shell) => Ok(Some((shell, iter.collect()))),
    }
}

pub(crate) fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "sh".to_string())
}

pub(crate) fn set_shell(ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    match parse_shell(ctx, def.shell.as_ref())? {
        Some((shell, args)) => {
            dag.shell = shell;
            dag.shell_args = args;
        }
        None => dag.shell = default_shell(),
    }
    ctx.shell = dag.shell.clone();
    ctx.shell_args = dag.shell_args.clone();
    Ok(())
}

/// Ordered env entries; earlier values feed later substitutions. The
/// stored list keeps one entry per key, last occurrence wins.
pub(crate) fn set_env(ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(value) = &def.env else { return Ok(()) };
    let pairs =
        key_value_pairs(value).map_err(|e| BuildError::InvalidEnvValue(e.to_string()))?;

    let mut entries: Vec<EnvVar> = Vec::with_capacity(pairs.len());
    for (key, raw) in pairs {
        let expanded = ctx
            .evaluator()
            .eval(&raw)
            .map_err(|e| BuildError::InvalidEnvValue(format!("{}: {}", key, e)))?;
        ctx.scope.set(key.clone(), expanded.clone());
        entries.retain(|existing| existing.key != key);
        entries.push(EnvVar::new(key, expanded));
    }
    dag.env = entries;
    Ok(())
}

/// Dotenv paths are recorded here and read lazily by `Dag::load_dotenv`.
pub(crate) fn set_dotenv(ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(value) = &def.dotenv else { return Ok(()) };
    let evaluator = ctx.evaluator();
    dag.dotenv = string_or_list(value)?
        .iter()
        .map(|path| evaluator.eval(path))
        .collect::<Result<_, _>>()
        .map_err(|e| BuildError::InvalidValue(e.to_string()))?;
    Ok(())
}

// ============================================================================
// MAIL
// ============================================================================

pub(crate) fn set_smtp(_ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(smtp) = &def.smtp else { return Ok(()) };
    dag.smtp = Some(SmtpConfig {
        host: smtp.host.clone().unwrap_or_default(),
        port: smtp.port.as_ref().map(port_string).transpose()?.unwrap_or_default(),
        username: smtp.username.clone().unwrap_or_default(),
        password: smtp.password.clone().unwrap_or_default(),
    });
    Ok(())
}

fn mail_config(def: &crate::def::MailDef) -> Result<MailConfig, BuildError> {
    Ok(MailConfig {
        from: def.from.clone().unwrap_or_default(),
        to: def.to.as_ref().map(string_or_list).transpose()?.unwrap_or_default(),
        prefix: def.prefix.clone().unwrap_or_default(),
        attach_logs: def.attach_logs.unwrap_or_default(),
    })
}

pub(crate) fn set_error_mail(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(mail) = &def.error_mail {
        dag.error_mail = Some(mail_config(mail)?);
    }
    Ok(())
}

pub(crate) fn set_info_mail(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(mail) = &def.info_mail {
        dag.info_mail = Some(mail_config(mail)?);
    }
    Ok(())
}

pub(crate) fn set_mail_on(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(mail_on) = &def.mail_on {
        dag.mail_on.failure = mail_on.failure.unwrap_or_default();
        dag.mail_on.success = mail_on.success.unwrap_or_default();
    }
    Ok(())
}

// ============================================================================
// SCHEDULE
// ============================================================================

/// Validate a cron expression. Five-field expressions get a seconds
/// prefix for the parser; `@daily`-style macros pass through.
fn check_cron(expression: &str) -> Result<(), BuildError> {
    let candidate = if expression.starts_with('@') {
        expression.to_string()
    } else {
        format!("0 {}", expression)
    };
    cron::Schedule::from_str(&candidate)
        .map(|_| ())
        .map_err(|_| BuildError::InvalidSchedule(expression.to_string()))
}

fn parse_schedule_list(value: &Value) -> Result<Vec<Schedule>, BuildError> {
    let expressions = match value {
        Value::Sequence(_) | Value::String(_) => string_or_list(value)
            .map_err(|_| BuildError::InvalidSchedule(format!("{:?}", value))),
        other => scalar_to_string(other)
            .map(|s| vec![s])
            .ok_or_else(|| BuildError::InvalidSchedule(format!("{:?}", other))),
    }?;
    expressions
        .into_iter()
        .map(|expression| {
            check_cron(&expression)?;
            Ok(Schedule { expression })
        })
        .collect()
}

/// Scalar, sequence, or `{start, stop, restart}` mapping. The dedicated
/// `stopSchedule` / `restartSchedule` keys override the mapping form.
pub(crate) fn set_schedules(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(value) = &def.schedule {
        match value {
            Value::Mapping(mapping) => {
                for (k, v) in mapping {
                    match k.as_str() {
                        Some("start") => dag.schedule = parse_schedule_list(v)?,
                        Some("stop") => dag.stop_schedule = parse_schedule_list(v)?,
                        Some("restart") => dag.restart_schedule = parse_schedule_list(v)?,
                        _ => {
                            return Err(BuildError::InvalidValue(
                                "schedule mapping may contain only start, stop, restart"
                                    .to_string(),
                            ))
                        }
                    }
                }
            }
            other => dag.schedule = parse_schedule_list(other)?,
        }
    }
    if let Some(value) = &def.stop_schedule {
        dag.stop_schedule = parse_schedule_list(value)?;
    }
    if let Some(value) = &def.restart_schedule {
        dag.restart_schedule = parse_schedule_list(value)?;
    }
    Ok(())
}

pub(crate) fn set_skip_if_successful(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.skip_if_successful = def.skip_if_successful.unwrap_or_default();
    Ok(())
}

// ============================================================================
// CONTAINER / SSH / OTEL
// ============================================================================

fn parse_pull_policy(value: &Value) -> Result<PullPolicy, BuildError> {
    match value {
        Value::Bool(true) => Ok(PullPolicy::Always),
        Value::Bool(false) => Ok(PullPolicy::Never),
        Value::String(s) => match s.as_str() {
            "always" | "true" => Ok(PullPolicy::Always),
            "never" | "false" => Ok(PullPolicy::Never),
            "missing" => Ok(PullPolicy::Missing),
            other => Err(BuildError::InvalidValue(format!(
                "invalid pullPolicy: {}",
                other
            ))),
        },
        _ => Err(BuildError::InvalidValue(
            "pullPolicy must be a string or a boolean".to_string(),
        )),
    }
}

/// Shared by the DAG-level field and per-step container overrides.
pub(crate) fn build_container(
    ctx: &BuildContext,
    def: &ContainerDef,
) -> Result<ContainerConfig, BuildError> {
    let image = def
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| BuildError::InvalidValue("container image is required".to_string()))?;

    let env = match &def.env {
        None => Vec::new(),
        Some(value) => {
            let evaluator = ctx.evaluator();
            key_value_pairs(value)?
                .into_iter()
                .map(|(key, raw)| {
                    evaluator
                        .eval(&raw)
                        .map(|value| EnvVar::new(key.clone(), value))
                        .map_err(|e| BuildError::InvalidEnvValue(format!("{}: {}", key, e)))
                })
                .collect::<Result<_, _>>()?
        }
    };

    Ok(ContainerConfig {
        image,
        name: def.name.clone().unwrap_or_default().trim().to_string(),
        pull_policy: def
            .pull_policy
            .as_ref()
            .map(parse_pull_policy)
            .transpose()?
            .unwrap_or_default(),
        env,
        volumes: def.volumes.clone().unwrap_or_default(),
        user: def.user.clone().unwrap_or_default(),
        working_dir: def.working_dir.clone().unwrap_or_default(),
        platform: def.platform.clone().unwrap_or_default(),
        network: def.network.clone().unwrap_or_default(),
    })
}

pub(crate) fn set_container(
    ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(container) = &def.container {
        dag.container = Some(build_container(ctx, container)?);
    }
    Ok(())
}

pub(crate) fn set_ssh(_ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(ssh) = &def.ssh else { return Ok(()) };
    let defaults = SshConfig::default();
    dag.ssh = Some(SshConfig {
        user: ssh.user.clone().unwrap_or_default(),
        host: ssh.host.clone().unwrap_or_default(),
        port: ssh.port.as_ref().map(port_string).transpose()?.unwrap_or(defaults.port),
        key: ssh.key.clone().unwrap_or_default(),
        password: ssh.password.clone().unwrap_or_default(),
        strict_host_key: ssh.strict_host_key.unwrap_or(defaults.strict_host_key),
        known_host_file: ssh.known_host_file.clone().unwrap_or(defaults.known_host_file),
    });
    Ok(())
}

pub(crate) fn set_otel(_ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    let Some(otel) = &def.otel else { return Ok(()) };
    let timeout_sec = otel
        .timeout_sec
        .map(|t| non_negative(t, "otel timeoutSec"))
        .transpose()?;
    dag.otel = Some(OtelConfig {
        enabled: otel.enabled.unwrap_or_default(),
        endpoint: otel.endpoint.clone().unwrap_or_default(),
        headers: otel.headers.clone().unwrap_or_default(),
        insecure: otel.insecure.unwrap_or_default(),
        timeout_sec,
    });
    Ok(())
}

// ============================================================================
// REGISTRY AUTHS / SECRETS
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryAuthDef {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
}

/// Mapping `registry -> auth`, with the reserved `_json` key carrying a
/// raw DOCKER_AUTH_CONFIG payload.
pub(crate) fn set_registry_auths(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let Some(value) = &def.registry_auths else { return Ok(()) };
    let mapping = value.as_mapping().ok_or_else(|| {
        BuildError::InvalidValue("registryAuths must be a mapping".to_string())
    })?;

    let mut auths = IndexMap::new();
    for (k, v) in mapping {
        let registry = k
            .as_str()
            .ok_or_else(|| BuildError::InvalidValue("registry keys must be strings".to_string()))?;
        if registry == "_json" {
            dag.registry_auth_config = Some(v.as_str().map(str::to_string).ok_or_else(|| {
                BuildError::InvalidValue("_json must be a string".to_string())
            })?);
            continue;
        }
        let auth: RegistryAuthDef = serde_yaml::from_value(v.clone()).map_err(|e| {
            BuildError::InvalidValue(format!("auth for {}: {}", registry, e))
        })?;
        auths.insert(
            registry.to_string(),
            RegistryAuth {
                username: auth.username.unwrap_or_default(),
                password: auth.password.unwrap_or_default(),
                auth: auth.auth.unwrap_or_default(),
            },
        );
    }
    dag.registry_auths = auths;
    Ok(())
}

pub(crate) fn set_secrets(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let Some(value) = &def.secrets else { return Ok(()) };
    let items = value
        .as_sequence()
        .ok_or_else(|| BuildError::InvalidValue("secrets must be a list".to_string()))?;

    let mut secrets: Vec<Secret> = Vec::with_capacity(items.len());
    for item in items {
        let secret: SecretDef = serde_yaml::from_value(item.clone())
            .map_err(|e| BuildError::InvalidValue(e.to_string()))?;
        let name = secret
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BuildError::InvalidValue("secret name is required".to_string()))?;
        let provider = secret
            .provider
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                BuildError::InvalidValue(format!("secret {}: provider is required", name))
            })?;
        let key = secret.key.filter(|k| !k.is_empty()).ok_or_else(|| {
            BuildError::InvalidValue(format!("secret {}: key is required", name))
        })?;
        if secrets.iter().any(|s| s.name == name) {
            return Err(BuildError::InvalidValue(format!(
                "duplicate secret name: {}",
                name
            )));
        }
        secrets.push(Secret {
            name,
            provider,
            key,
            options: secret.options.unwrap_or_default(),
        });
    }
    dag.secrets = secrets;
    Ok(())
}

// ============================================================================
// QUOTAS / MISC
// ============================================================================

pub(crate) fn set_worker_selector(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.worker_selector = def.worker_selector.clone().unwrap_or_default();
    Ok(())
}

pub(crate) fn set_run_config(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(rc) = &def.run_config {
        dag.run_config.disable_param_edit = rc.disable_param_edit.unwrap_or_default();
        dag.run_config.disable_run_id_edit = rc.disable_run_id_edit.unwrap_or_default();
    }
    Ok(())
}

pub(crate) fn set_max_output_size(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(size) = def.max_output_size {
        dag.max_output_size = non_negative(size, "maxOutputSize")?;
    }
    Ok(())
}

pub(crate) fn set_hist_retention_days(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.hist_retention_days = def.hist_retention_days.unwrap_or(DEFAULT_HIST_RETENTION_DAYS);
    Ok(())
}

pub(crate) fn set_max_clean_up_time(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    dag.max_clean_up_time_sec = match def.max_clean_up_time_sec {
        None => DEFAULT_MAX_CLEANUP_TIME_SEC,
        Some(sec) => non_negative(sec, "maxCleanUpTimeSec")?,
    };
    Ok(())
}

/// Missing defaults to 1; `-1` is preserved verbatim (queueing disabled).
pub(crate) fn set_max_active_runs(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let runs = def.max_active_runs.unwrap_or(DEFAULT_MAX_ACTIVE_RUNS);
    if runs < -1 {
        return Err(BuildError::InvalidValue(
            "maxActiveRuns must be >= -1".to_string(),
        ));
    }
    dag.max_active_runs = runs;
    Ok(())
}

pub(crate) fn set_max_active_steps(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(steps) = def.max_active_steps {
        dag.max_active_steps = non_negative(steps, "maxActiveSteps")? as i64;
    }
    Ok(())
}

// ============================================================================
// PRECONDITIONS
// ============================================================================

/// Scalar, `{condition, expected}` mapping, or a sequence of either.
pub(crate) fn parse_conditions(value: &Value) -> Result<Vec<Condition>, BuildError> {
    fn one(value: &Value) -> Result<Condition, BuildError> {
        match value {
            Value::Mapping(mapping) => {
                let mut condition = Condition::default();
                for (k, v) in mapping {
                    match k.as_str() {
                        Some("condition") => {
                            condition.condition = scalar_to_string(v).ok_or_else(|| {
                                BuildError::InvalidValue("condition must be a scalar".to_string())
                            })?
                        }
                        Some("expected") => {
                            condition.expected = scalar_to_string(v).ok_or_else(|| {
                                BuildError::InvalidValue("expected must be a scalar".to_string())
                            })?
                        }
                        _ => {
                            return Err(BuildError::InvalidValue(
                                "precondition may contain only condition and expected"
                                    .to_string(),
                            ))
                        }
                    }
                }
                if condition.condition.is_empty() {
                    return Err(BuildError::InvalidValue(
                        "precondition requires a condition".to_string(),
                    ));
                }
                Ok(condition)
            }
            other => scalar_to_string(other)
                .map(|condition| Condition {
                    condition,
                    expected: String::new(),
                })
                .ok_or_else(|| {
                    BuildError::InvalidValue(
                        "precondition must be a string or a mapping".to_string(),
                    )
                }),
        }
    }

    match value {
        Value::Sequence(items) => items.iter().map(one).collect(),
        other => Ok(vec![one(other)?]),
    }
}

pub(crate) fn set_preconditions(
    _ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    if let Some(value) = &def.preconditions {
        dag.preconditions = parse_conditions(value)?;
    }
    Ok(())
}

// ============================================================================
// TYPE / HANDLERS
// ============================================================================

pub(crate) fn set_type(_ctx: &mut BuildContext, def: &DagDef, dag: &mut Dag) -> Result<(), BuildError> {
    dag.dag_type = match def.dag_type.as_deref() {
        None | Some("chain") => DagType::Chain,
        Some("graph") => DagType::Graph,
        Some(other) => {
            return Err(BuildError::InvalidValue(format!(
                "type must be chain or graph, got {}",
                other
            )))
        }
    };
    Ok(())
}

/// Lifecycle handlers reuse the step builder. `cancel` is accepted as a
/// legacy alias for `abort` with a deprecation warning; both together is
/// an error.
pub(crate) fn set_handlers(
    ctx: &mut BuildContext,
    def: &DagDef,
    dag: &mut Dag,
) -> Result<(), BuildError> {
    let Some(handlers) = &def.handler_on else { return Ok(()) };

    if handlers.abort.is_some() && handlers.cancel.is_some() {
        return Err(BuildError::InvalidValue(
            "handlerOn.abort and handlerOn.cancel are mutually exclusive".to_string(),
        ));
    }

    if let Some(value) = &handlers.init {
        dag.handler_on.init = Some(build_handler_step(ctx, value, "onInit", dag)?);
    }
    if let Some(value) = &handlers.exit {
        dag.handler_on.exit = Some(build_handler_step(ctx, value, "onExit", dag)?);
    }
    if let Some(value) = &handlers.success {
        dag.handler_on.success = Some(build_handler_step(ctx, value, "onSuccess", dag)?);
    }
    if let Some(value) = &handlers.failure {
        dag.handler_on.failure = Some(build_handler_step(ctx, value, "onFailure", dag)?);
    }
    if let Some(value) = &handlers.abort {
        dag.handler_on.cancel = Some(build_handler_step(ctx, value, "onCancel", dag)?);
    }
    if let Some(value) = &handlers.cancel {
        ctx.warn("handlerOn.cancel is deprecated; use handlerOn.abort");
        dag.handler_on.cancel = Some(build_handler_step(ctx, value, "onCancel", dag)?);
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{build_dag, BuildOpts};
    use crate::dag::PullPolicy;
    use crate::def::DagDef;
    use crate::errors::BuildError;

    fn build(yaml: &str) -> crate::dag::Dag {
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
    fn test_env_list_preserves_order_and_layers() {
        let dag = build(
            r#"
env:
  - A: x
  - B: ${A}y
steps:
  - echo hi
"#,
        );
        assert_eq!(dag.env[0].value, "x");
        assert_eq!(dag.env[1].value, "xy");
    }

    #[test]
    fn test_env_duplicate_key_keeps_last() {
        let dag = build("env:\n  - K: first\n  - K: second\nsteps:\n  - echo hi\n");
        assert_eq!(dag.env.len(), 1);
        assert_eq!(dag.env[0].value, "second");
    }

    #[test]
    fn test_env_mapping_form() {
        let dag = build("env:\n  FOO: bar\nsteps:\n  - echo hi\n");
        assert_eq!(dag.env[0].key, "FOO");
    }

    #[test]
    fn test_no_eval_preserves_raw_env() {
        let def: DagDef =
            serde_yaml::from_str("env:\n  - A: x\n  - B: ${A}y\nsteps:\n  - echo hi\n").unwrap();
        let dag = build_dag(&def, &BuildOpts::new().without_eval(), None).unwrap();
        assert_eq!(dag.env[1].value, "${A}y");
    }

    #[test]
    fn test_shell_string_splits_into_args() {
        let dag = build("shell: bash -e\nsteps:\n  - echo hi\n");
        assert_eq!(dag.shell, "bash");
        assert_eq!(dag.shell_args, vec!["-e".to_string()]);
    }

    #[test]
    fn test_schedule_scalar_and_mapping() {
        let dag = build("schedule: \"0 1 * * *\"\nsteps:\n  - echo hi\n");
        assert_eq!(dag.schedule[0].expression, "0 1 * * *");

        let dag = build(
            "schedule:\n  start: \"0 1 * * *\"\n  stop: \"0 2 * * *\"\nsteps:\n  - echo hi\n",
        );
        assert_eq!(dag.schedule.len(), 1);
        assert_eq!(dag.stop_schedule.len(), 1);
    }

    #[test]
    fn test_invalid_schedule() {
        let err = build_err("schedule: \"1\"\nsteps:\n  - echo hi\n");
        assert!(err.contains("invalid schedule: 1"));
    }

    #[test]
    fn test_schedule_macro_accepted() {
        let dag = build("schedule: \"@daily\"\nsteps:\n  - echo hi\n");
        assert_eq!(dag.schedule[0].expression, "@daily");
    }

    #[test]
    fn test_container_requires_image() {
        let err = build_err("container:\n  name: box\nsteps:\n  - echo hi\n");
        assert!(err.contains("container image is required"));
    }

    #[test]
    fn test_container_pull_policy_table() {
        let dag = build("container:\n  image: python:3.11\nsteps:\n  - echo hi\n");
        assert_eq!(dag.container.as_ref().unwrap().pull_policy, PullPolicy::Missing);

        let dag = build(
            "container:\n  image: python:3.11\n  pullPolicy: true\nsteps:\n  - echo hi\n",
        );
        assert_eq!(dag.container.as_ref().unwrap().pull_policy, PullPolicy::Always);

        let dag = build(
            "container:\n  image: python:3.11\n  pullPolicy: never\nsteps:\n  - echo hi\n",
        );
        assert_eq!(dag.container.as_ref().unwrap().pull_policy, PullPolicy::Never);
    }

    #[test]
    fn test_container_name_is_trimmed() {
        let dag = build(
            "container:\n  image: python:3.11\n  name: \"  box  \"\nsteps:\n  - echo hi\n",
        );
        assert_eq!(dag.container.as_ref().unwrap().name, "box");
    }

    #[test]
    fn test_ssh_defaults() {
        let dag = build("ssh:\n  user: deploy\n  host: example.com\nsteps:\n  - echo hi\n");
        let ssh = dag.ssh.unwrap();
        assert_eq!(ssh.port, "22");
        assert!(ssh.strict_host_key);
    }

    #[test]
    fn test_ssh_numeric_port() {
        let dag = build("ssh:\n  host: example.com\n  port: 2222\nsteps:\n  - echo hi\n");
        assert_eq!(dag.ssh.unwrap().port, "2222");
    }

    #[test]
    fn test_registry_auths_with_json_key() {
        let dag = build(
            r#"
registryAuths:
  ghcr.io:
    username: bot
    password: hunter2
  _json: '{"auths": {}}'
steps:
  - echo hi
"#,
        );
        assert_eq!(dag.registry_auths["ghcr.io"].username, "bot");
        assert_eq!(dag.registry_auth_config.as_deref(), Some(r#"{"auths": {}}"#));
    }

    #[test]
    fn test_secrets_require_fields_and_unique_names() {
        let err = build_err("secrets:\n  - name: A\n    provider: vault\nsteps:\n  - echo hi\n");
        assert!(err.contains("key is required"));

        let err = build_err(
            r#"
secrets:
  - name: A
    provider: vault
    key: k1
  - name: A
    provider: vault
    key: k2
steps:
  - echo hi
"#,
        );
        assert!(err.contains("duplicate secret name: A"));
    }

    #[test]
    fn test_max_active_runs_bounds() {
        let dag = build("maxActiveRuns: -1\nsteps:\n  - echo hi\n");
        assert_eq!(dag.max_active_runs, -1);

        let err = build_err("maxActiveRuns: -2\nsteps:\n  - echo hi\n");
        assert!(err.contains("maxActiveRuns must be >= -1"));
    }

    #[test]
    fn test_type_validation() {
        let err = build_err("type: ring\nsteps:\n  - echo hi\n");
        assert!(err.contains("type must be chain or graph"));
    }

    #[test]
    fn test_handler_cancel_warns_and_abort_conflicts() {
        let def: DagDef = serde_yaml::from_str(
            "handlerOn:\n  cancel:\n    command: echo bye\nsteps:\n  - echo hi\n",
        )
        .unwrap();
        let dag = build_dag(&def, &BuildOpts::new(), None).unwrap();
        assert!(dag.handler_on.cancel.is_some());
        assert!(dag.build_warnings[0].contains("deprecated"));

        let err = build_err(
            "handlerOn:\n  abort:\n    command: echo a\n  cancel:\n    command: echo b\nsteps:\n  - echo hi\n",
        );
        assert!(err.contains("mutually exclusive"));
    }

    #[test]
    fn test_tags_comma_string() {
        let dag = build("tags: daily, critical\nsteps:\n  - echo hi\n");
        assert_eq!(dag.tags, vec!["daily".to_string(), "critical".to_string()]);
    }

    #[test]
    fn test_mail_to_accepts_string_or_list() {
        let dag = build(
            "errorMail:\n  from: ops@example.com\n  to:\n    - a@example.com\n    - b@example.com\nsteps:\n  - echo hi\n",
        );
        assert_eq!(dag.error_mail.unwrap().to.len(), 2);
    }

    #[test]
    fn test_smtp_port_numeric_or_string() {
        let dag = build("smtp:\n  host: mail\n  port: 587\nsteps:\n  - echo hi\n");
        assert_eq!(dag.smtp.unwrap().port, "587");
    }

    #[test]
    fn test_working_dir_env_expansion_err_is_flagged() {
        let def: DagDef = serde_yaml::from_str("workingDir: \"`exit 1`\"\n").unwrap();
        let err = super::super::build_dag(&def, &BuildOpts::new(), None).unwrap_err();
        assert!(matches!(
            err.iter().next().unwrap().error,
            BuildError::InvalidValue(_)
        ));
    }
}
