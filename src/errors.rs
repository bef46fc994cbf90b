//! # Build Errors
//!
//! Error taxonomy for the definition pipeline.
//!
//! Three kinds of failures flow through here:
//!
//! 1. **Structural** - unknown keys, malformed YAML, duplicate sub-DAG names
//! 2. **Value** - invalid schedule, empty command, backoff <= 1.0, ...
//! 3. **Evaluation** - command substitution or schema fetch failures
//!
//! Transformers never panic; each returns a [`BuildError`] which the
//! pipeline wraps into a [`FieldError`] carrying the owning field path.
//! [`ErrorList`] collects them in deterministic (pipeline) order. Callers
//! match sentinel conditions with `matches!` on the enum variants:
//!
//! ```rust
//! use dagfile::errors::BuildError;
//!
//! let err = BuildError::StepCommandIsEmpty;
//! assert!(matches!(err, BuildError::StepCommandIsEmpty));
//! ```

use std::fmt;
use thiserror::Error;

// ============================================================================
// BUILD ERROR
// ============================================================================

/// Errors produced while reifying a definition into a typed DAG.
///
/// The named variants at the top are sentinel values that downstream code
/// is allowed to match on; the message text for those is stable.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Env entry failed to parse or expand
    #[error("invalid env value: {0}")]
    InvalidEnvValue(String),

    /// Param entry failed to parse, expand, or validate
    #[error("invalid param value: {0}")]
    InvalidParamValue(String),

    /// Schedule expression is not a valid cron expression
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Step has no command, script, or action
    #[error("step command is empty")]
    StepCommandIsEmpty,

    /// `command:` was neither a string nor an accepted sequence form
    #[error("command must be a string or an array")]
    StepCommandMustBeArrayOrString,

    /// More than one command on an executor without the capability
    #[error("executor does not support multiple commands")]
    ExecutorDoesNotSupportMultipleCmd,

    /// `signalOnStop` is not a known signal name
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// `timeoutSec` was negative
    #[error("timeoutSec must be non-negative")]
    TimeoutMustBeNonNegative,

    /// Document carries keys outside the known set
    #[error("has invalid keys: {0}")]
    InvalidKeys(String),

    /// Generic typed-value mismatch, message carries the expectation
    #[error("{0}")]
    InvalidValue(String),

    /// Parameter schema validation failure (message lists violations)
    #[error("parameter validation failed: {0}")]
    ParamSchemaViolation(String),

    /// Parameter schema could not be fetched or parsed
    #[error("failed to load parameter schema {location}: {reason}")]
    ParamSchemaLoad { location: String, reason: String },

    /// Dependency graph contains a cycle
    #[error("cycle detected involving step {0}")]
    CycleDetected(String),

    /// A `depends` entry references a step that does not exist
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    /// YAML decode failure
    #[error("yaml decode error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem failure (dotenv, base config, local schema)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// FIELD ERROR + ERROR LIST
// ============================================================================

/// A build error annotated with the field path that produced it.
///
/// Rendered as `"{field}: {error}"`, e.g.
/// `continueOn.failure: expected boolean, got string`.
#[derive(Debug)]
pub struct FieldError {
    pub field: String,
    pub error: BuildError,
}

impl FieldError {
    pub fn new(field: impl Into<String>, error: BuildError) -> Self {
        Self {
            field: field.into(),
            error,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{}: {}", self.field, self.error)
        }
    }
}

impl std::error::Error for FieldError {}

/// Ordered collection of [`FieldError`]s from one build.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<FieldError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error under the given field path.
    pub fn push(&mut self, field: impl Into<String>, error: BuildError) {
        self.errors.push(FieldError::new(field, error));
    }

    pub fn push_field_error(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    /// Append all entries of another list, preserving order.
    pub fn extend(&mut self, other: ErrorList) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<FieldError> {
        self.errors
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

// ============================================================================
// LOAD ERROR (façade)
// ============================================================================

/// Top-level error returned by the `load*` entry points.
#[derive(Error, Debug)]
pub enum LoadError {
    /// One or more build errors; rendering lists them line by line
    #[error("{0}")]
    Build(ErrorList),

    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// The byte stream was not valid YAML
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LoadError {
    /// Borrow the underlying error list, when this is a build failure.
    pub fn build_errors(&self) -> Option<&ErrorList> {
        match self {
            LoadError::Build(list) => Some(list),
            _ => None,
        }
    }
}

impl From<ErrorList> for LoadError {
    fn from(list: ErrorList) -> Self {
        LoadError::Build(list)
    }
}

// ============================================================================
// TESTS
// ============================================================================
