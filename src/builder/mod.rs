//! # Builder Pipeline
//!
//! Reifies raw definitions into typed DAGs through an ordered list of
//! `(field, transformer)` pairs. Each transformer owns exactly one field
//! of the output; the driver tags any error it returns with that field
//! name, which keeps error paths uniform across the whole surface.
//!
//! Ordering matters only where later stages consume earlier results:
//! the working directory and env are set before params (schema resolution
//! and `${...}` expansion need them), and steps come last.
//!
//! Builds are single-threaded and share nothing; concurrent calls from
//! different threads are safe as long as callers do not share a mutated
//! [`BuildOpts`].

use std::path::{Path, PathBuf};

use crate::dag::Dag;
use crate::def::DagDef;
use crate::errors::{BuildError, ErrorList};
use crate::eval::{Evaluator, Scope};

pub mod base;
pub mod dag;
pub mod params;
pub mod resolve;
pub mod step;
pub mod validate;

// ============================================================================
// BUILD OPTIONS
// ============================================================================

/// CLI-supplied parameter overrides.
#[derive(Debug, Clone)]
pub enum ParamsSource {
    /// One shell-quoted string, e.g. `"first P1=foo"`
    Text(String),
    /// Pre-split tokens
    List(Vec<String>),
}

/// Options guiding a single build.
#[derive(Debug, Clone, Default)]
pub struct BuildOpts {
    pub name: Option<String>,
    pub base_config: Option<PathBuf>,
    pub params: Option<ParamsSource>,
    pub dags_dir: Option<PathBuf>,
    pub default_working_dir: Option<PathBuf>,
    pub metadata_only: bool,
    pub skip_schema_validation: bool,
    pub no_eval: bool,
    pub allow_build_errors: bool,
    pub skip_base_handlers: bool,
}

impl BuildOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used when the document does not set one.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Shared base configuration overlaid under every document.
    pub fn base_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_config = Some(path.into());
        self
    }

    /// Parameter overrides as one shell-quoted string.
    pub fn params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(ParamsSource::Text(params.into()));
        self
    }

    /// Parameter overrides as pre-split tokens.
    pub fn params_list<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = Some(ParamsSource::List(
            params.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Directory DAG definitions are loaded from; used as a working-dir
    /// fallback for documents built from bytes.
    pub fn dags_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dags_dir = Some(dir.into());
        self
    }

    /// Overrides the file-derived working directory.
    pub fn default_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_working_dir = Some(dir.into());
        self
    }

    /// Build only identity and quota fields; skip steps and handlers.
    pub fn metadata_only(mut self) -> Self {
        self.metadata_only = true;
        self
    }

    /// Bypass parameter-schema fetch, defaults, and validation.
    pub fn skip_schema_validation(mut self) -> Self {
        self.skip_schema_validation = true;
        self
    }

    /// Preserve raw `${...}` and backtick forms instead of expanding.
    pub fn without_eval(mut self) -> Self {
        self.no_eval = true;
        self
    }

    /// Return the DAG populated as far as possible, with the error list
    /// stored on it, instead of failing the build.
    pub fn allow_build_errors(mut self) -> Self {
        self.allow_build_errors = true;
        self
    }

    /// Do not inherit `handlerOn.*` from the base config.
    pub fn skip_base_handlers(mut self) -> Self {
        self.skip_base_handlers = true;
        self
    }
}

// ============================================================================
// BUILD CONTEXT
// ============================================================================

/// Shared state threaded through the transformer pipeline.
pub struct BuildContext {
    pub opts: BuildOpts,
    pub location: Option<PathBuf>,
    /// Variable scope: process env, then DAG env, then params
    pub scope: Scope,
    /// Resolved DAG shell, used for backtick command substitution
    pub shell: String,
    pub shell_args: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: ErrorList,
    /// Step names grouped by parallel-sibling groups, in source order;
    /// filled by the steps transformer, consumed by the resolver
    pub step_groups: Vec<Vec<String>>,
}

impl BuildContext {
    pub fn new(opts: BuildOpts, location: Option<&Path>) -> Self {
        Self {
            opts,
            location: location.map(Path::to_path_buf),
            scope: Scope::new(),
            shell: String::new(),
            shell_args: Vec::new(),
            warnings: Vec::new(),
            errors: ErrorList::new(),
            step_groups: Vec::new(),
        }
    }

    /// Evaluator over the current scope, honoring `without_eval`.
    pub fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(&self.scope)
            .with_shell(&self.shell, &self.shell_args)
            .no_eval(self.opts.no_eval)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

type DagTransform = fn(&mut BuildContext, &DagDef, &mut Dag) -> Result<(), BuildError>;

/// Full transformer pipeline, in execution order.
const DAG_PIPELINE: &[(&str, DagTransform)] = &[
    ("name", dag::set_name),
    ("description", dag::set_description),
    ("tags", dag::set_tags),
    ("workingDir", dag::set_working_dir),
    ("logDir", dag::set_log_dir),
    ("shell", dag::set_shell),
    ("env", dag::set_env),
    ("dotenv", dag::set_dotenv),
    ("params", params::set_params),
    ("smtp", dag::set_smtp),
    ("errorMail", dag::set_error_mail),
    ("infoMail", dag::set_info_mail),
    ("mailOn", dag::set_mail_on),
    ("schedule", dag::set_schedules),
    ("skipIfSuccessful", dag::set_skip_if_successful),
    ("container", dag::set_container),
    ("ssh", dag::set_ssh),
    ("otel", dag::set_otel),
    ("registryAuths", dag::set_registry_auths),
    ("secrets", dag::set_secrets),
    ("workerSelector", dag::set_worker_selector),
    ("runConfig", dag::set_run_config),
    ("maxOutputSize", dag::set_max_output_size),
    ("histRetentionDays", dag::set_hist_retention_days),
    ("maxCleanUpTimeSec", dag::set_max_clean_up_time),
    ("maxActiveRuns", dag::set_max_active_runs),
    ("maxActiveSteps", dag::set_max_active_steps),
    ("preconditions", dag::set_preconditions),
    ("type", dag::set_type),
    ("handlerOn", dag::set_handlers),
    ("steps", step::set_steps),
];

/// Identity and quota fields only; everything else keeps its default.
const METADATA_PIPELINE: &[(&str, DagTransform)] = &[
    ("name", dag::set_name),
    ("description", dag::set_description),
    ("tags", dag::set_tags),
    ("schedule", dag::set_schedules),
    ("maxActiveRuns", dag::set_max_active_runs),
];

/// Run the pipeline over one definition.
///
/// With `allow_build_errors`, the returned DAG reflects whatever partial
/// state was assembled and carries the error list; otherwise any error
/// fails the build.
pub fn build_dag(
    def: &DagDef,
    opts: &BuildOpts,
    location: Option<&Path>,
) -> Result<Dag, ErrorList> {
    let mut ctx = BuildContext::new(opts.clone(), location);
    let mut dag = Dag {
        location: ctx.location.clone(),
        ..Default::default()
    };

    let pipeline = if ctx.opts.metadata_only {
        METADATA_PIPELINE
    } else {
        DAG_PIPELINE
    };

    for (field, transform) in pipeline {
        if let Err(e) = transform(&mut ctx, def, &mut dag) {
            ctx.errors.push(*field, e);
        }
    }

    if !ctx.opts.metadata_only {
        resolve::resolve_dependencies(&mut ctx, &mut dag);
        validate::validate_dag(&mut ctx, &dag);
    }

    dag.build_warnings = std::mem::take(&mut ctx.warnings);

    if ctx.errors.is_empty() {
        Ok(dag)
    } else if ctx.opts.allow_build_errors {
        dag.build_errors = ctx.errors.into_vec();
        Ok(dag)
    } else {
        Err(ctx.errors)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DEFAULT_HIST_RETENTION_DAYS, DEFAULT_MAX_CLEANUP_TIME_SEC};

    fn def(yaml: &str) -> DagDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let dag = build_dag(
            &def("name: d\nsteps:\n  - echo hi\n"),
            &BuildOpts::new(),
            None,
        )
        .unwrap();
        assert_eq!(dag.hist_retention_days, DEFAULT_HIST_RETENTION_DAYS);
        assert_eq!(dag.max_clean_up_time_sec, DEFAULT_MAX_CLEANUP_TIME_SEC);
        assert_eq!(dag.max_active_runs, 1);
    }

    #[test]
    fn test_metadata_only_reverts_behavioral_fields() {
        let yaml = r#"
name: d
histRetentionDays: 99
maxCleanUpTimeSec: 60
schedule: "0 1 * * *"
steps:
  - echo hi
"#;
        let dag = build_dag(&def(yaml), &BuildOpts::new().metadata_only(), None).unwrap();
        assert_eq!(dag.name, "d");
        assert_eq!(dag.schedule.len(), 1);
        assert!(dag.steps.is_empty());
        // behavioral fields revert to defaults regardless of the YAML
        assert_eq!(dag.hist_retention_days, DEFAULT_HIST_RETENTION_DAYS);
        assert_eq!(dag.max_clean_up_time_sec, DEFAULT_MAX_CLEANUP_TIME_SEC);
    }

    #[test]
    fn test_allow_build_errors_returns_partial_dag() {
        let yaml = "name: d\nschedule: \"1\"\nsteps:\n  - echo hi\n";
        let opts = BuildOpts::new().allow_build_errors();
        let dag = build_dag(&def(yaml), &opts, None).unwrap();
        assert_eq!(dag.steps.len(), 1);
        assert_eq!(dag.build_errors.len(), 1);
        assert!(dag.build_errors[0].to_string().starts_with("schedule:"));
    }

    #[test]
    fn test_errors_fail_build_without_flag() {
        let yaml = "name: d\nschedule: \"1\"\n";
        assert!(build_dag(&def(yaml), &BuildOpts::new(), None).is_err());
    }
}
