//! # Typed Step Model
//!
//! One node of the DAG: a command, script, sub-DAG invocation, or non-shell
//! action, plus its retry/repeat/continue policies. Built from
//! [`crate::def::StepDef`] by the step transformer pipeline.

use indexmap::IndexMap;
use serde::Serialize;

/// Platform-wide default for parallel fan-out concurrency.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

// ============================================================================
// STEP
// ============================================================================

#[derive(Debug, Default, Serialize)]
pub struct Step {
    pub name: String,
    pub id: Option<String>,
    pub description: String,
    /// Working directory; `workingDir` wins over `dir` in the definition
    pub dir: String,
    pub commands: Vec<Command>,
    pub script: Option<String>,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub shell_packages: Vec<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub log_output: Option<LogOutput>,
    pub output: Option<Output>,
    pub depends: Vec<String>,
    /// True iff the user wrote an explicit empty list, opting out of
    /// chain-mode auto-dependencies
    pub explicitly_no_deps: bool,
    pub continue_on: ContinueOn,
    pub retry_policy: Option<RetryPolicy>,
    pub repeat_policy: Option<RepeatPolicy>,
    pub signal_on_stop: Option<String>,
    pub mail_on_error: bool,
    pub timeout_sec: Option<u64>,
    pub preconditions: Vec<crate::dag::Condition>,
    pub env: Vec<crate::dag::EnvVar>,
    pub worker_selector: IndexMap<String, String>,
    pub executor: ExecutorConfig,
    pub container: Option<crate::dag::ContainerConfig>,
    pub parallel: Option<ParallelConfig>,
    pub sub_dag: Option<SubDag>,
    pub llm: Option<LlmConfig>,
    pub messages: Vec<Message>,
    pub agent: Option<AgentConfig>,
    pub router: Option<RouterConfig>,
    /// Structured params pass-through for executors that accept them
    pub params: Option<String>,
}

// ============================================================================
// COMMANDS
// ============================================================================

/// One command invocation within a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Command {
    pub command: String,
    pub args: Vec<String>,
    /// The original joined form, kept for display and late re-evaluation
    pub cmd_with_args: String,
}

/// How step stdout/stderr files relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Separate,
    Merged,
}

/// Output capture: variable name, optional JSON-path key, omit flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Output {
    pub name: String,
    pub key: Option<String>,
    pub omit: bool,
}

// ============================================================================
// CONTINUE-ON
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContinueOn {
    pub skipped: bool,
    pub failure: bool,
    pub exit_code: Vec<i64>,
    pub mark_success: bool,
    pub output: Vec<String>,
}

// ============================================================================
// RETRY / REPEAT
// ============================================================================

/// Retry policy. `limit` and `interval_sec` hold the resolved numeric
/// values; the `_expr` twins carry `${...}` forms deferred to run time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub limit: u64,
    pub limit_expr: Option<String>,
    pub interval_sec: u64,
    pub interval_expr: Option<String>,
    pub exit_codes: Vec<i64>,
    pub backoff: Option<f64>,
    pub max_interval_sec: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    While,
    Until,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepeatPolicy {
    pub mode: Option<RepeatMode>,
    pub interval_sec: Option<u64>,
    pub limit: Option<u64>,
    pub condition: Option<crate::dag::Condition>,
    pub exit_codes: Vec<i64>,
    pub backoff: Option<f64>,
    pub max_interval_sec: Option<u64>,
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Executor selection plus its opaque, schema-checked config.
///
/// An empty type means the default shell executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub executor_type: String,
    pub config: IndexMap<String, serde_json::Value>,
}

impl ExecutorConfig {
    pub fn typed(executor_type: impl Into<String>) -> Self {
        Self {
            executor_type: executor_type.into(),
            config: IndexMap::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.executor_type.is_empty()
    }
}

// ============================================================================
// PARALLEL / SUB-DAG
// ============================================================================

/// One fan-out item: a scalar value or an ordered string map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParallelItem {
    Value(String),
    Params(IndexMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParallelConfig {
    pub items: Vec<ParallelItem>,
    /// Set when items come from a `${VAR}` reference resolved at run time
    pub source_var: Option<String>,
    pub max_concurrent: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            source_var: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// A step invoking another named DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubDag {
    pub name: String,
    /// Stringified params (`key="val" ...`), re-split by the executor
    pub params: String,
}

// ============================================================================
// LLM / AGENT / ROUTER
// ============================================================================

/// Model reference: bare name or provider-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ModelRef {
    Name(String),
    Spec { provider: String, name: String },
}

impl Default for ModelRef {
    fn default() -> Self {
        ModelRef::Name(String::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LlmConfig {
    pub model: ModelRef,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub system_prompt: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentConfig {
    pub max_iterations: Option<u64>,
    pub tools: Vec<String>,
    pub prompt: Option<String>,
}

/// Route pattern class, in match-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteKind {
    Exact,
    Regex,
    CatchAll,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Route {
    pub pattern: String,
    pub targets: Vec<String>,
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        if self.pattern == "re:.*" {
            RouteKind::CatchAll
        } else if self.pattern.starts_with("re:") {
            RouteKind::Regex
        } else {
            RouteKind::Exact
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterConfig {
    pub value: String,
    pub routes: Vec<Route>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_default_concurrency() {
        assert_eq!(ParallelConfig::default().max_concurrent, 8);
    }

    #[test]
    fn test_executor_default_is_shell() {
        let exec = ExecutorConfig::default();
        assert!(exec.is_default());
        assert!(!ExecutorConfig::typed("docker").is_default());
    }

    #[test]
    fn test_route_kinds_order() {
        let exact = Route {
            pattern: "prod".into(),
            targets: vec!["deploy".into()],
        };
        let regex = Route {
            pattern: "re:v[0-9]+".into(),
            targets: vec!["tag".into()],
        };
        let catch_all = Route {
            pattern: "re:.*".into(),
            targets: vec!["fallback".into()],
        };
        assert_eq!(exact.kind(), RouteKind::Exact);
        assert_eq!(regex.kind(), RouteKind::Regex);
        assert_eq!(catch_all.kind(), RouteKind::CatchAll);
        assert!(RouteKind::Exact < RouteKind::Regex);
        assert!(RouteKind::Regex < RouteKind::CatchAll);
    }
}
