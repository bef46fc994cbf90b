//! # Dagfile
//!
//! Declarative YAML workflow definitions compiled into validated DAGs.
//!
//! ## Overview
//!
//! A workflow is a directed acyclic graph of steps described in a YAML
//! document. This library loads, validates, and compiles those documents
//! into typed [`Dag`] objects an external executor can run. Running
//! steps, queueing, history, and servers are out of scope.
//!
//! The pipeline, in order:
//!
//! 1. **Document reader** - multi-doc split, strict unknown-key rejection,
//!    root + local sub-DAG tagging ([`reader`])
//! 2. **Base-config merge** - overlay the user definition over a shared
//!    base, at the definition level ([`builder::base`])
//! 3. **Transformer pipelines** - one function per field, DAG-level then
//!    per-step ([`builder`])
//! 4. **Dependency resolution** - id rewriting, chain-mode injection,
//!    cycle detection ([`builder::resolve`])
//! 5. **Cross-field validation** - executor capability matrix, config
//!    schemas, namespace rules ([`builder::validate`])
//!
//! ## Example
//!
//! ```rust
//! let yaml = br#"
//! name: etl
//! schedule: "0 2 * * *"
//! env:
//!   - DATA_DIR: /var/data
//! steps:
//!   - name: extract
//!     command: fetch.sh ${DATA_DIR}
//!   - name: transform
//!     command: transform.sh
//!   - name: load
//!     command: load.sh
//! "#;
//!
//! let dag = dagfile::load_yaml(yaml).unwrap();
//! assert_eq!(dag.name, "etl");
//! // chain mode: each step depends on its predecessor
//! assert_eq!(dag.steps[2].depends, vec!["transform".to_string()]);
//! ```
//!
//! ## Loading with options
//!
//! ```rust,no_run
//! use dagfile::BuildOpts;
//!
//! let opts = BuildOpts::new()
//!     .base_config("/etc/dagfile/base.yaml")
//!     .params("TARGET=staging")
//!     .allow_build_errors();
//! let dag = dagfile::load("workflows/deploy.yaml", opts)?;
//! for warning in &dag.build_warnings {
//!     eprintln!("warning: {}", warning);
//! }
//! # Ok::<(), dagfile::LoadError>(())
//! ```

use std::path::Path;

pub mod builder;
pub mod dag;
pub mod def;
pub mod errors;
pub mod eval;
pub mod reader;
pub mod step;

pub use builder::{BuildOpts, ParamsSource};
pub use dag::{
    Condition, ContainerConfig, Dag, DagType, EnvVar, HandlerOn, MailConfig, MailOn, OtelConfig,
    Param, PullPolicy, RegistryAuth, RunConfig, Schedule, Secret, SmtpConfig, SshConfig,
};
pub use errors::{BuildError, ErrorList, FieldError, LoadError};
pub use eval::{Evaluator, Scope};
pub use step::{
    AgentConfig, Command, ContinueOn, ExecutorConfig, LlmConfig, LogOutput, Message, ModelRef,
    Output, ParallelConfig, ParallelItem, RepeatMode, RepeatPolicy, RetryPolicy, Route,
    RouterConfig, Step, SubDag,
};

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Load a DAG from a file. The path also becomes [`Dag::location`] and the
/// default working-directory anchor.
pub fn load(path: impl AsRef<Path>, opts: BuildOpts) -> Result<Dag, LoadError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    load_internal(&bytes, &opts, Some(path))
}

/// Load a DAG from bytes with default options.
pub fn load_yaml(yaml: &[u8]) -> Result<Dag, LoadError> {
    load_internal(yaml, &BuildOpts::new(), None)
}

/// Load a DAG from bytes.
pub fn load_yaml_with_opts(yaml: &[u8], opts: BuildOpts) -> Result<Dag, LoadError> {
    load_internal(yaml, &opts, None)
}

/// Load a base configuration file on its own (steps are typically absent;
/// the result is what other DAGs inherit from).
pub fn load_base_config(path: impl AsRef<Path>, opts: BuildOpts) -> Result<Dag, LoadError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let docs = reader::parse_documents(&bytes).map_err(LoadError::Build)?;
    builder::build_dag(&docs.root, &opts, Some(path)).map_err(LoadError::Build)
}

// ============================================================================
// INTERNAL
// ============================================================================

fn read_base_def(path: &Path) -> Result<def::DagDef, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let docs = reader::parse_documents(&bytes).map_err(LoadError::Build)?;
    Ok(docs.root)
}

/// Build the root document, then each local sub-DAG in document order.
/// Base-config options apply to every document.
fn load_internal(yaml: &[u8], opts: &BuildOpts, location: Option<&Path>) -> Result<Dag, LoadError> {
    tracing::debug!(
        location = location.map(|p| p.display().to_string()).unwrap_or_default(),
        "building dag"
    );
    let docs = reader::parse_documents(yaml).map_err(LoadError::Build)?;

    let base_def = match &opts.base_config {
        None => None,
        Some(path) => Some(read_base_def(path)?),
    };
    let overlay = |def: def::DagDef| match &base_def {
        Some(base) => builder::base::merge_defs(base.clone(), def, opts.skip_base_handlers),
        None => def,
    };

    let mut all_errors = ErrorList::new();
    let mut root = match builder::build_dag(&overlay(docs.root), opts, location) {
        Ok(dag) => Some(dag),
        Err(errors) => {
            all_errors.extend(errors);
            None
        }
    };

    // Local sub-DAGs carry their own name and params.
    let local_opts = BuildOpts {
        name: None,
        params: None,
        ..opts.clone()
    };
    for local_def in docs.locals {
        let name = local_def.name.clone().unwrap_or_default();
        match builder::build_dag(&overlay(local_def), &local_opts, location) {
            Ok(local) => {
                if let Some(root) = root.as_mut() {
                    root.local_dags.insert(name, local);
                }
            }
            Err(errors) => {
                for fe in errors.into_vec() {
                    let field = if fe.field.is_empty() {
                        format!("localDags[{}]", name)
                    } else {
                        format!("localDags[{}].{}", name, fe.field)
                    };
                    all_errors.push(field, fe.error);
                }
            }
        }
    }

    match (root, all_errors.is_empty()) {
        (Some(dag), true) => Ok(dag),
        (_, _) => Err(LoadError::Build(all_errors)),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_yaml_smoke() {
        let dag = load_yaml(b"name: smoke\nsteps:\n  - echo hi\n").unwrap();
        assert_eq!(dag.name, "smoke");
        assert_eq!(dag.steps.len(), 1);
    }

    #[test]
    fn test_local_dags_built_in_document_order() {
        let yaml = br#"
name: root
steps:
  - call: first
  - call: second
---
name: first
steps:
  - echo one
---
name: second
steps:
  - echo two
"#;
        let dag = load_yaml(yaml).unwrap();
        let names: Vec<&String> = dag.local_dags.keys().collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(dag.local_dags["first"].steps.len(), 1);
    }

    #[test]
    fn test_local_dag_errors_carry_document_path() {
        let yaml = b"name: root\nsteps:\n  - echo hi\n---\nname: bad\nschedule: \"1\"\n";
        let err = load_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("localDags[bad].schedule"));
    }

    #[test]
    fn test_load_sets_location_and_name_from_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly-sync.yaml");
        std::fs::write(&path, "steps:\n  - echo hi\n").unwrap();
        let dag = load(&path, BuildOpts::new()).unwrap();
        assert_eq!(dag.name, "nightly-sync");
        assert_eq!(dag.location.as_deref(), Some(path.as_path()));
        assert_eq!(dag.working_dir, dir.path());
    }

    #[test]
    fn test_base_config_inheritance() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        std::fs::write(
            &base,
            "logDir: /var/log/flows\nenv:\n  - REGION: eu\nhandlerOn:\n  failure:\n    command: notify.sh\n",
        )
        .unwrap();

        let yaml = b"name: child\nenv:\n  - REGION: us\nsteps:\n  - echo hi\n";
        let opts = BuildOpts::new().base_config(&base);
        let dag = load_yaml_with_opts(yaml, opts).unwrap();
        assert_eq!(dag.log_dir, "/var/log/flows");
        // child env wins over base
        assert_eq!(dag.env.len(), 1);
        assert_eq!(dag.env[0].value, "us");
        assert!(dag.handler_on.failure.is_some());

        let opts = BuildOpts::new().base_config(&base).skip_base_handlers();
        let dag = load_yaml_with_opts(yaml, opts).unwrap();
        assert!(dag.handler_on.failure.is_none());
    }

    #[test]
    fn test_load_base_config_alone() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        std::fs::write(&base, "logDir: /var/log/flows\n").unwrap();
        let dag = load_base_config(&base, BuildOpts::new()).unwrap();
        assert_eq!(dag.log_dir, "/var/log/flows");
        assert!(dag.steps.is_empty());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load("/definitely/not/here.yaml", BuildOpts::new()).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }
}
