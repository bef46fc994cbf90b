//! # Typed DAG Model
//!
//! The built, validated workflow object produced by the builder pipeline.
//! Everything here is immutable after the build - the one exception is
//! [`Dag::load_dotenv`], which lazily folds `.env` entries into the env
//! list without touching the process environment.
//!
//! ## Example
//!
//! ```rust
//! let yaml = br#"
//! name: hello
//! steps:
//!   - echo hello
//!   - echo world
//! "#;
//! let dag = dagfile::load_yaml(yaml).unwrap();
//! assert_eq!(dag.name, "hello");
//! assert_eq!(dag.steps.len(), 2);
//! assert_eq!(dag.steps[1].depends, vec!["cmd_1".to_string()]);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;

use crate::errors::{BuildError, FieldError};
use crate::step::Step;

/// Default history retention when the document does not set one.
pub const DEFAULT_HIST_RETENTION_DAYS: i64 = 30;
/// Default cleanup budget in seconds.
pub const DEFAULT_MAX_CLEANUP_TIME_SEC: u64 = 5;
/// Default number of concurrently admitted runs.
pub const DEFAULT_MAX_ACTIVE_RUNS: i64 = 1;

// ============================================================================
// DAG ROOT
// ============================================================================

/// Ordering mode for steps without explicit dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DagType {
    /// Each step auto-depends on its predecessor group
    #[default]
    Chain,
    /// Dependencies come only from explicit `depends`
    Graph,
}

/// A built workflow graph, ready for the executor.
#[derive(Debug, Serialize)]
pub struct Dag {
    pub name: String,
    pub description: String,
    /// Source path when loaded from a file
    pub location: Option<PathBuf>,
    #[serde(rename = "type")]
    pub dag_type: DagType,
    pub working_dir: PathBuf,
    pub log_dir: String,
    /// Dotenv file paths, resolved lazily by [`Dag::load_dotenv`]
    pub dotenv: Vec<String>,
    /// Ordered `KEY=VALUE` environment entries
    pub env: Vec<EnvVar>,
    /// Ordered positional/named parameters
    pub params: Vec<Param>,
    pub schedule: Vec<Schedule>,
    pub stop_schedule: Vec<Schedule>,
    pub restart_schedule: Vec<Schedule>,
    pub skip_if_successful: bool,
    pub tags: Vec<String>,
    pub hist_retention_days: i64,
    pub max_clean_up_time_sec: u64,
    pub max_active_runs: i64,
    pub max_active_steps: i64,
    /// 0 means "use the runtime default"
    pub max_output_size: u64,
    pub preconditions: Vec<Condition>,
    pub handler_on: HandlerOn,
    pub mail_on: MailOn,
    pub smtp: Option<SmtpConfig>,
    pub error_mail: Option<MailConfig>,
    pub info_mail: Option<MailConfig>,
    pub ssh: Option<SshConfig>,
    pub container: Option<ContainerConfig>,
    pub otel: Option<OtelConfig>,
    pub registry_auths: IndexMap<String, RegistryAuth>,
    /// Raw DOCKER_AUTH_CONFIG payload from the reserved `_json` key
    pub registry_auth_config: Option<String>,
    pub secrets: Vec<Secret>,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub run_config: RunConfig,
    pub worker_selector: IndexMap<String, String>,
    /// Non-root documents of the same file, keyed by their `name`
    pub local_dags: IndexMap<String, Dag>,
    pub steps: Vec<Step>,
    pub build_warnings: Vec<String>,
    /// Populated only under `allow_build_errors`
    #[serde(serialize_with = "serialize_field_errors")]
    pub build_errors: Vec<FieldError>,
}

fn serialize_field_errors<S>(errors: &[FieldError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}

impl Default for Dag {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            location: None,
            dag_type: DagType::default(),
            working_dir: PathBuf::new(),
            log_dir: String::new(),
            dotenv: Vec::new(),
            env: Vec::new(),
            params: Vec::new(),
            schedule: Vec::new(),
            stop_schedule: Vec::new(),
            restart_schedule: Vec::new(),
            skip_if_successful: false,
            tags: Vec::new(),
            hist_retention_days: DEFAULT_HIST_RETENTION_DAYS,
            max_clean_up_time_sec: DEFAULT_MAX_CLEANUP_TIME_SEC,
            max_active_runs: DEFAULT_MAX_ACTIVE_RUNS,
            max_active_steps: 0,
            max_output_size: 0,
            preconditions: Vec::new(),
            handler_on: HandlerOn::default(),
            mail_on: MailOn::default(),
            smtp: None,
            error_mail: None,
            info_mail: None,
            ssh: None,
            container: None,
            otel: None,
            registry_auths: IndexMap::new(),
            registry_auth_config: None,
            secrets: Vec::new(),
            shell: String::new(),
            shell_args: Vec::new(),
            run_config: RunConfig::default(),
            worker_selector: IndexMap::new(),
            local_dags: IndexMap::new(),
            steps: Vec::new(),
            build_warnings: Vec::new(),
            build_errors: Vec::new(),
        }
    }
}

impl Dag {
    /// Find a step by its name.
    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn max_clean_up_time(&self) -> Duration {
        Duration::from_secs(self.max_clean_up_time_sec)
    }

    /// Read the configured dotenv files into the env list.
    ///
    /// Relative paths resolve against the working directory first, then the
    /// DAG file's directory. Keys already present in the env list win over
    /// dotenv values. The process environment is never modified.
    pub fn load_dotenv(&mut self) -> Result<(), BuildError> {
        for entry in self.dotenv.clone() {
            let path = self.resolve_dotenv_path(&entry);
            tracing::debug!(path = %path.display(), "loading dotenv file");
            for item in dotenvy::from_path_iter(&path).map_err(|e| {
                BuildError::InvalidValue(format!("dotenv {}: {}", path.display(), e))
            })? {
                let (key, value) = item.map_err(|e| {
                    BuildError::InvalidValue(format!("dotenv {}: {}", path.display(), e))
                })?;
                if !self.env.iter().any(|v| v.key == key) {
                    self.env.push(EnvVar { key, value });
                }
            }
        }
        Ok(())
    }

    fn resolve_dotenv_path(&self, entry: &str) -> PathBuf {
        let raw = Path::new(entry);
        if raw.is_absolute() {
            return raw.to_path_buf();
        }
        let in_working_dir = self.working_dir.join(raw);
        if in_working_dir.exists() {
            return in_working_dir;
        }
        if let Some(dir) = self.location.as_ref().and_then(|p| p.parent()) {
            let in_location = dir.join(raw);
            if in_location.exists() {
                return in_location;
            }
        }
        in_working_dir
    }
}

// ============================================================================
// ENV / PARAMS
// ============================================================================

/// One ordered environment entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One parameter. Positional params carry their 1-based index as the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Param {
    pub name: String,
    pub value: String,
}

impl Param {
    pub fn named(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn positional(index: usize, value: impl Into<String>) -> Self {
        Self {
            name: index.to_string(),
            value: value.into(),
        }
    }

    /// Whether the name is a 1-based position rather than a key.
    pub fn is_positional(&self) -> bool {
        self.name.chars().all(|c| c.is_ascii_digit())
    }
}

// ============================================================================
// SCHEDULE
// ============================================================================

/// A single cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub expression: String,
}

// ============================================================================
// CONDITIONS
// ============================================================================

/// A precondition or repeat condition: a command or expression, with an
/// optional expected output to compare against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

// ============================================================================
// HANDLERS / MAIL
// ============================================================================

/// Lifecycle handler steps. The `cancel` slot is filled by either the
/// `abort` key (canonical) or the legacy `cancel` key.
#[derive(Debug, Default, Serialize)]
pub struct HandlerOn {
    pub init: Option<Step>,
    pub exit: Option<Step>,
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailOn {
    pub failure: bool,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailConfig {
    pub from: String,
    pub to: Vec<String>,
    pub prefix: String,
    pub attach_logs: bool,
}

// ============================================================================
// SSH / CONTAINER / OTEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: String,
    pub key: String,
    pub password: String,
    pub strict_host_key: bool,
    pub known_host_file: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: String::new(),
            port: "22".to_string(),
            key: String::new(),
            password: String::new(),
            strict_host_key: true,
            known_host_file: String::new(),
        }
    }
}

/// Image pull behavior for container-backed steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub pull_policy: PullPolicy,
    pub env: Vec<EnvVar>,
    pub volumes: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub platform: String,
    pub network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OtelConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub headers: IndexMap<String, String>,
    pub insecure: bool,
    pub timeout_sec: Option<u64>,
}

// ============================================================================
// REGISTRY / SECRETS / RUN CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub auth: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Secret {
    pub name: String,
    pub provider: String,
    pub key: String,
    pub options: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub disable_param_edit: bool,
    pub disable_run_id_edit: bool,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_ssh_defaults() {
        let ssh = SshConfig::default();
        assert_eq!(ssh.port, "22");
        assert!(ssh.strict_host_key);
        assert!(ssh.known_host_file.is_empty());
    }

    #[test]
    fn test_pull_policy_default_is_missing() {
        assert_eq!(PullPolicy::default(), PullPolicy::Missing);
    }

    #[test]
    fn test_param_positional_detection() {
        assert!(Param::positional(1, "x").is_positional());
        assert!(!Param::named("P1", "x").is_positional());
    }

    #[test]
    fn test_load_dotenv_existing_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(".env")).unwrap();
        writeln!(file, "FROM_DOTENV=yes").unwrap();
        writeln!(file, "SHARED=dotenv").unwrap();

        let mut dag = Dag {
            working_dir: dir.path().to_path_buf(),
            dotenv: vec![".env".to_string()],
            env: vec![EnvVar::new("SHARED", "dag")],
            ..Default::default()
        };
        dag.load_dotenv().unwrap();

        assert_eq!(dag.env.len(), 2);
        assert_eq!(dag.env[0], EnvVar::new("SHARED", "dag"));
        assert_eq!(dag.env[1], EnvVar::new("FROM_DOTENV", "yes"));
    }

    #[test]
    fn test_load_dotenv_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = Dag {
            working_dir: dir.path().to_path_buf(),
            dotenv: vec!["absent.env".to_string()],
            ..Default::default()
        };
        assert!(dag.load_dotenv().is_err());
    }

    #[test]
    fn test_step_by_name() {
        let dag = Dag {
            steps: vec![Step {
                name: "build".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(dag.step_by_name("build").is_some());
        assert!(dag.step_by_name("missing").is_none());
    }
}
