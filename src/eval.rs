//! # Expression Evaluator
//!
//! String interpolation over a layered variable scope:
//!
//! - `${NAME}` - lookup; unknown names stay literal
//! - `${NAME:-default}` - fallback when unset or empty
//! - `${NAME:offset}` / `${NAME:offset:length}` - substring; negative
//!   offsets are bounded to 0
//! - `` `command` `` - run via the configured shell, capture stdout, trim
//!   the trailing newline
//!
//! Evaluation is a single pass over the input; there is no re-scanning of
//! produced text. The whole layer is gated by `no_eval`, which preserves
//! raw forms for tooling and diffing.

use indexmap::IndexMap;
use std::process::Command as ProcessCommand;
use thiserror::Error;

use crate::dag::EnvVar;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("command substitution `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("command substitution `{command}` could not run: {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },
}

// ============================================================================
// SCOPE
// ============================================================================

/// Layered variable environment. Entries set here shadow the process
/// environment; the process environment is never mutated.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: IndexMap<String, String>,
    use_process_env: bool,
}

impl Scope {
    /// Scope backed by the process environment.
    pub fn new() -> Self {
        Self {
            vars: IndexMap::new(),
            use_process_env: true,
        }
    }

    /// Scope with no process-environment fallback.
    pub fn isolated() -> Self {
        Self {
            vars: IndexMap::new(),
            use_process_env: false,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Layer a list of env entries on top of the current scope.
    pub fn extend(&mut self, vars: &[EnvVar]) {
        for var in vars {
            self.set(var.key.clone(), var.value.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(v) = self.vars.get(name) {
            return Some(v.clone());
        }
        if self.use_process_env {
            return std::env::var(name).ok();
        }
        None
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

/// Expansion engine bound to one scope and one shell.
pub struct Evaluator<'a> {
    scope: &'a Scope,
    shell: String,
    shell_args: Vec<String>,
    no_eval: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a Scope) -> Self {
        Self {
            scope,
            shell: "sh".to_string(),
            shell_args: Vec::new(),
            no_eval: false,
        }
    }

    /// Shell used for backtick command substitution.
    pub fn with_shell(mut self, shell: &str, args: &[String]) -> Self {
        if !shell.is_empty() {
            self.shell = shell.to_string();
        }
        self.shell_args = args.to_vec();
        self
    }

    /// When set, [`Evaluator::eval`] returns its input untouched.
    pub fn no_eval(mut self, no_eval: bool) -> Self {
        self.no_eval = no_eval;
        self
    }

    /// Expand all `${...}` references and backtick substitutions.
    pub fn eval(&self, input: &str) -> Result<String, EvalError> {
        if self.no_eval {
            return Ok(input.to_string());
        }

        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix("${") {
                if let Some(close) = stripped.find('}') {
                    self.expand_braced(&stripped[..close], &mut out);
                    rest = &stripped[close + 1..];
                    continue;
                }
            }
            if let Some(stripped) = rest.strip_prefix('`') {
                if let Some(close) = stripped.find('`') {
                    let output = self.command_substitution(&stripped[..close])?;
                    out.push_str(&output);
                    rest = &stripped[close + 1..];
                    continue;
                }
            }
            let mut chars = rest.chars();
            if let Some(ch) = chars.next() {
                out.push(ch);
            }
            rest = chars.as_str();
        }

        Ok(out)
    }

    /// Expand one `${...}` body. Unknown or malformed references keep the
    /// original text.
    fn expand_braced(&self, content: &str, out: &mut String) {
        if let Some((name, default)) = content.split_once(":-") {
            match self.scope.get(name) {
                Some(value) if !value.is_empty() => out.push_str(&value),
                _ => out.push_str(default),
            }
            return;
        }

        if let Some((name, spec)) = content.split_once(':') {
            if let Some(sliced) = self
                .scope
                .get(name)
                .and_then(|value| substring(&value, spec))
            {
                out.push_str(&sliced);
                return;
            }
            out.push_str("${");
            out.push_str(content);
            out.push('}');
            return;
        }

        match self.scope.get(content) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(content);
                out.push('}');
            }
        }
    }

    fn command_substitution(&self, command: &str) -> Result<String, EvalError> {
        tracing::debug!(command, shell = %self.shell, "command substitution");
        let output = ProcessCommand::new(&self.shell)
            .args(&self.shell_args)
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|source| EvalError::CommandSpawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(EvalError::CommandFailed {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        while stdout.ends_with('\n') || stdout.ends_with('\r') {
            stdout.pop();
        }
        Ok(stdout)
    }
}

/// `offset[:length]` substring over characters, bash-style bounds.
fn substring(value: &str, spec: &str) -> Option<String> {
    let (offset_str, length_str) = match spec.split_once(':') {
        Some((o, l)) => (o, Some(l)),
        None => (spec, None),
    };

    let offset: i64 = offset_str.trim().parse().ok()?;
    let offset = offset.max(0) as usize;

    let chars: Vec<char> = value.chars().collect();
    if offset >= chars.len() {
        return Some(String::new());
    }

    let remaining = &chars[offset..];
    let taken = match length_str {
        Some(l) => {
            let length: i64 = l.trim().parse().ok()?;
            let length = length.max(0) as usize;
            &remaining[..length.min(remaining.len())]
        }
        None => remaining,
    };
    Some(taken.iter().collect())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> Scope {
        let mut s = Scope::isolated();
        for (k, v) in pairs {
            s.set(*k, *v);
        }
        s
    }

    #[test]
    fn test_plain_lookup() {
        let s = scope(&[("NAME", "world")]);
        let out = Evaluator::new(&s).eval("hello ${NAME}").unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_unknown_stays_literal() {
        let s = Scope::isolated();
        let out = Evaluator::new(&s).eval("hello ${MISSING}").unwrap();
        assert_eq!(out, "hello ${MISSING}");
    }

    #[test]
    fn test_layered_values_compose() {
        let s = scope(&[("A", "x"), ("B", "xy")]);
        let out = Evaluator::new(&s).eval("${B}").unwrap();
        assert_eq!(out, "xy");
    }

    #[test]
    fn test_default_when_unset_or_empty() {
        let s = scope(&[("EMPTY", "")]);
        let ev = Evaluator::new(&s);
        assert_eq!(ev.eval("${MISSING:-fallback}").unwrap(), "fallback");
        assert_eq!(ev.eval("${EMPTY:-fallback}").unwrap(), "fallback");
    }

    #[test]
    fn test_default_not_used_when_set() {
        let s = scope(&[("SET", "value")]);
        assert_eq!(
            Evaluator::new(&s).eval("${SET:-fallback}").unwrap(),
            "value"
        );
    }

    #[test]
    fn test_substring_offset() {
        let s = scope(&[("VAR", "abcdef")]);
        let ev = Evaluator::new(&s);
        assert_eq!(ev.eval("${VAR:2}").unwrap(), "cdef");
        assert_eq!(ev.eval("${VAR:2:3}").unwrap(), "cde");
    }

    #[test]
    fn test_substring_negative_offset_bounded_to_zero() {
        let s = scope(&[("VAR", "abcdef")]);
        // `:-` wins the parse, so a bare `${VAR:-2}` is the default form;
        // a negative offset needs the bash-style space.
        assert_eq!(Evaluator::new(&s).eval("${VAR:-2:3}").unwrap(), "abcdef");
        assert_eq!(Evaluator::new(&s).eval("${VAR: -2}").unwrap(), "abcdef");
        assert_eq!(Evaluator::new(&s).eval("${VAR: -2:3}").unwrap(), "abc");
    }

    #[test]
    fn test_substring_out_of_range() {
        let s = scope(&[("VAR", "ab")]);
        let ev = Evaluator::new(&s);
        assert_eq!(ev.eval("${VAR:5}").unwrap(), "");
        assert_eq!(ev.eval("${VAR:1:99}").unwrap(), "b");
    }

    #[test]
    fn test_malformed_substring_stays_literal() {
        let s = scope(&[("VAR", "ab")]);
        assert_eq!(Evaluator::new(&s).eval("${VAR:x}").unwrap(), "${VAR:x}");
    }

    #[test]
    fn test_no_eval_passthrough() {
        let s = scope(&[("NAME", "world")]);
        let out = Evaluator::new(&s)
            .no_eval(true)
            .eval("hello ${NAME} `echo hi`")
            .unwrap();
        assert_eq!(out, "hello ${NAME} `echo hi`");
    }

    #[test]
    fn test_command_substitution_trims_trailing_newline() {
        let s = Scope::isolated();
        let out = Evaluator::new(&s).eval("got `echo hi`").unwrap();
        assert_eq!(out, "got hi");
    }

    #[test]
    fn test_command_substitution_failure_is_error() {
        let s = Scope::isolated();
        let err = Evaluator::new(&s).eval("`exit 3`").unwrap_err();
        assert!(matches!(err, EvalError::CommandFailed { .. }));
    }

    #[test]
    fn test_unterminated_brace_stays_literal() {
        let s = scope(&[("NAME", "x")]);
        assert_eq!(Evaluator::new(&s).eval("${NAME").unwrap(), "${NAME");
    }

    #[test]
    fn test_process_env_fallback() {
        std::env::set_var("DAGFILE_EVAL_TEST_VAR", "from-process");
        let s = Scope::new();
        assert_eq!(
            Evaluator::new(&s).eval("${DAGFILE_EVAL_TEST_VAR}").unwrap(),
            "from-process"
        );
        std::env::remove_var("DAGFILE_EVAL_TEST_VAR");
    }

    #[test]
    fn test_scope_shadows_process_env() {
        std::env::set_var("DAGFILE_EVAL_SHADOWED", "process");
        let mut s = Scope::new();
        s.set("DAGFILE_EVAL_SHADOWED", "scoped");
        assert_eq!(
            Evaluator::new(&s).eval("${DAGFILE_EVAL_SHADOWED}").unwrap(),
            "scoped"
        );
        std::env::remove_var("DAGFILE_EVAL_SHADOWED");
    }
}
