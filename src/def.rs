//! # Raw Definition Model
//!
//! Serde-facing structures decoded straight from YAML documents, before the
//! builder pipeline reifies them into [`crate::dag::Dag`] /
//! [`crate::step::Step`].
//!
//! ## Shape policy
//!
//! Fields with a single accepted shape decode into typed options. Fields
//! that accept several YAML shapes (`env` as mapping or list of mappings,
//! `command` as string or sequence, ...) stay as `serde_yaml::Value` here
//! and are normalized by their owning transformer with an explicit `match`
//! on the node type - that is what keeps the error messages precise.
//!
//! ## Key strictness
//!
//! Unknown keys are a hard error (`has invalid keys: <key>`). The document
//! reader checks the root mapping against [`DAG_KEYS`]; the step builder
//! checks each step mapping against [`STEP_KEYS`]. Nested single-shape
//! structures rely on `deny_unknown_fields` instead.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;

use crate::errors::BuildError;

// ============================================================================
// KNOWN KEYS
// ============================================================================

/// Accepted keys at the DAG document root (case-sensitive).
pub const DAG_KEYS: &[&str] = &[
    "name",
    "description",
    "type",
    "workingDir",
    "logDir",
    "dotenv",
    "env",
    "params",
    "schedule",
    "stopSchedule",
    "restartSchedule",
    "skipIfSuccessful",
    "tags",
    "histRetentionDays",
    "maxCleanUpTimeSec",
    "maxActiveRuns",
    "maxActiveSteps",
    "maxOutputSize",
    "preconditions",
    "handlerOn",
    "mailOn",
    "smtp",
    "errorMail",
    "infoMail",
    "ssh",
    "container",
    "otel",
    "registryAuths",
    "secrets",
    "shell",
    "runConfig",
    "workerSelector",
    "steps",
];

/// Accepted keys on a step mapping (case-sensitive).
pub const STEP_KEYS: &[&str] = &[
    "name",
    "id",
    "description",
    "dir",
    "workingDir",
    "command",
    "shell",
    "shellPackages",
    "script",
    "stdout",
    "stderr",
    "logOutput",
    "output",
    "depends",
    "continueOn",
    "retryPolicy",
    "repeatPolicy",
    "mailOnError",
    "preconditions",
    "signalOnStop",
    "call",
    "run",
    "params",
    "parallel",
    "workerSelector",
    "env",
    "timeoutSec",
    "container",
    "executor",
    "type",
    "config",
    "llm",
    "messages",
    "agent",
    "value",
    "routes",
];

/// Collect mapping keys not present in `allowed`, in document order.
pub fn unknown_keys(mapping: &serde_yaml::Mapping, allowed: &[&str]) -> Vec<String> {
    mapping
        .keys()
        .filter_map(|k| k.as_str())
        .filter(|k| !allowed.contains(k))
        .map(str::to_string)
        .collect()
}

/// Reject a mapping carrying keys outside `allowed`.
pub fn ensure_known_keys(
    mapping: &serde_yaml::Mapping,
    allowed: &[&str],
) -> Result<(), BuildError> {
    let unknown = unknown_keys(mapping, allowed);
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(BuildError::InvalidKeys(unknown.join(", ")))
    }
}

// ============================================================================
// DAG DEFINITION
// ============================================================================

/// One YAML document, decoded but not yet built.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DagDef {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub dag_type: Option<String>,
    pub working_dir: Option<String>,
    pub log_dir: Option<String>,
    /// String or sequence of strings
    pub dotenv: Option<Value>,
    /// Mapping or sequence of single-key mappings
    pub env: Option<Value>,
    /// String, sequence, or `{schema, values}` mapping
    pub params: Option<Value>,
    /// Scalar, sequence, or `{start, stop, restart}` mapping
    pub schedule: Option<Value>,
    pub stop_schedule: Option<Value>,
    pub restart_schedule: Option<Value>,
    pub skip_if_successful: Option<bool>,
    /// Comma-separated string or sequence
    pub tags: Option<Value>,
    pub hist_retention_days: Option<i64>,
    pub max_clean_up_time_sec: Option<i64>,
    pub max_active_runs: Option<i64>,
    pub max_active_steps: Option<i64>,
    pub max_output_size: Option<i64>,
    /// Scalar, `{condition, expected}`, or sequence of either
    pub preconditions: Option<Value>,
    pub handler_on: Option<HandlerOnDef>,
    pub mail_on: Option<MailOnDef>,
    pub smtp: Option<SmtpDef>,
    pub error_mail: Option<MailDef>,
    pub info_mail: Option<MailDef>,
    pub ssh: Option<SshDef>,
    pub container: Option<ContainerDef>,
    pub otel: Option<OtelDef>,
    /// Mapping registry -> auth mapping, plus the reserved `_json` key
    pub registry_auths: Option<Value>,
    /// Sequence of `{name, provider, key, options}`
    pub secrets: Option<Value>,
    /// String (`"bash -e"`) or sequence (`[bash, -e]`)
    pub shell: Option<Value>,
    pub run_config: Option<RunConfigDef>,
    pub worker_selector: Option<IndexMap<String, String>>,
    /// Sequence of step mappings / strings / nested groups
    pub steps: Option<Value>,
}

/// Handler steps keyed by lifecycle event. Each value is a step definition
/// in any of the step shorthand shapes; `cancel` is the legacy alias for
/// `abort`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerOnDef {
    pub init: Option<Value>,
    pub exit: Option<Value>,
    pub success: Option<Value>,
    pub failure: Option<Value>,
    pub abort: Option<Value>,
    pub cancel: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailOnDef {
    pub failure: Option<bool>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpDef {
    pub host: Option<String>,
    /// Numeric or string
    pub port: Option<Value>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MailDef {
    pub from: Option<String>,
    /// String or sequence of strings
    pub to: Option<Value>,
    pub prefix: Option<String>,
    pub attach_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SshDef {
    pub user: Option<String>,
    pub host: Option<String>,
    /// Numeric or string
    pub port: Option<Value>,
    pub key: Option<String>,
    pub password: Option<String>,
    pub strict_host_key: Option<bool>,
    pub known_host_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerDef {
    pub image: Option<String>,
    pub name: Option<String>,
    /// `always` / `never` / `missing`, or boolean shorthand
    pub pull_policy: Option<Value>,
    /// Mapping or sequence of single-key mappings
    pub env: Option<Value>,
    pub volumes: Option<Vec<String>>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub platform: Option<String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OtelDef {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub headers: Option<IndexMap<String, String>>,
    pub insecure: Option<bool>,
    pub timeout_sec: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfigDef {
    pub disable_param_edit: Option<bool>,
    pub disable_run_id_edit: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretDef {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub key: Option<String>,
    pub options: Option<IndexMap<String, String>>,
}

// ============================================================================
// STEP DEFINITION
// ============================================================================

/// One step mapping, decoded but not yet built.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepDef {
    pub name: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub dir: Option<String>,
    /// Preferred over `dir` when both are present
    pub working_dir: Option<String>,
    /// String, sequence of strings, or sequence with nested argv arrays
    pub command: Option<Value>,
    /// String or sequence, overrides the DAG shell
    pub shell: Option<Value>,
    pub shell_packages: Option<Vec<String>>,
    pub script: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub log_output: Option<String>,
    /// Bare name or `{name, key, omit}` mapping
    pub output: Option<Value>,
    /// Scalar, sequence, or explicit empty sequence
    pub depends: Option<Value>,
    /// `"skipped"` / `"failed"` or a mapping
    pub continue_on: Option<Value>,
    pub retry_policy: Option<RetryPolicyDef>,
    pub repeat_policy: Option<RepeatPolicyDef>,
    pub mail_on_error: Option<bool>,
    pub preconditions: Option<Value>,
    pub signal_on_stop: Option<String>,
    /// Sub-DAG name
    pub call: Option<String>,
    /// Deprecated alias for `call`
    pub run: Option<String>,
    /// Params string/sequence; stringified for sub-DAG calls, kept
    /// structured for executors that accept them
    pub params: Option<Value>,
    /// `${VAR}` string, sequence of items, or `{items, maxConcurrent}`
    pub parallel: Option<Value>,
    pub worker_selector: Option<IndexMap<String, String>>,
    /// Mapping or sequence of single-key mappings
    pub env: Option<Value>,
    pub timeout_sec: Option<i64>,
    pub container: Option<ContainerDef>,
    /// String type or `{type, config}` mapping
    pub executor: Option<Value>,
    /// Shorthand for `executor.type`
    #[serde(rename = "type")]
    pub step_type: Option<String>,
    /// Shorthand for `executor.config`
    pub config: Option<Value>,
    pub llm: Option<LlmDef>,
    /// Sequence of `{role, content}` mappings
    pub messages: Option<Value>,
    pub agent: Option<AgentDef>,
    /// Router input value
    pub value: Option<String>,
    /// Router routes: ordered mapping or sequence of `{pattern, targets}`
    pub routes: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicyDef {
    /// Count or `${...}` string for deferred evaluation
    pub limit: Option<Value>,
    /// Seconds or `${...}` string
    pub interval_sec: Option<Value>,
    /// Single code or sequence
    pub exit_code: Option<Value>,
    /// Float > 1.0, or `true` for 2.0
    pub backoff: Option<Value>,
    pub max_interval_sec: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RepeatPolicyDef {
    /// Boolean shorthand or explicit `"while"` / `"until"`
    pub repeat: Option<Value>,
    pub interval_sec: Option<i64>,
    pub limit: Option<i64>,
    pub condition: Option<String>,
    pub expected: Option<String>,
    pub exit_code: Option<Value>,
    pub backoff: Option<Value>,
    pub max_interval_sec: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LlmDef {
    /// Model name string or `{provider, name}` mapping
    pub model: Option<Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i64>,
    pub system_prompt: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentDef {
    pub max_iterations: Option<i64>,
    pub tools: Option<Vec<String>>,
    pub prompt: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================
