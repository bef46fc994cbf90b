//! # Base-Config Merger
//!
//! Overlays a user definition on top of a shared base definition. The
//! merge happens at the *definition* level, before any building, so
//! "unset by the child" is still observable.
//!
//! Rules:
//! - scalar fields: adopted from the base only when the child leaves them
//!   unset
//! - `env`: base entries first, then child entries; the env transformer
//!   de-duplicates by key keeping the last occurrence, so child values win
//! - `schedule` (all three kinds), `params`, `steps`, `handlerOn`: child
//!   overrides wholesale; base steps are never inherited
//! - `skip_base_handlers` drops the base `handlerOn` entirely

use serde_yaml::Value;

use crate::def::DagDef;

/// Merge `child` over `base`.
pub fn merge_defs(base: DagDef, child: DagDef, skip_base_handlers: bool) -> DagDef {
    let env = merge_env(base.env, child.env);
    let child_has_schedule = child.schedule.is_some()
        || child.stop_schedule.is_some()
        || child.restart_schedule.is_some();

    DagDef {
        name: child.name,
        description: child.description.or(base.description),
        dag_type: child.dag_type.or(base.dag_type),
        working_dir: child.working_dir.or(base.working_dir),
        log_dir: child.log_dir.or(base.log_dir),
        dotenv: child.dotenv.or(base.dotenv),
        env,
        params: child.params.or(base.params),
        schedule: if child_has_schedule {
            child.schedule
        } else {
            base.schedule
        },
        stop_schedule: if child_has_schedule {
            child.stop_schedule
        } else {
            base.stop_schedule
        },
        restart_schedule: if child_has_schedule {
            child.restart_schedule
        } else {
            base.restart_schedule
        },
        skip_if_successful: child.skip_if_successful.or(base.skip_if_successful),
        tags: child.tags.or(base.tags),
        hist_retention_days: child.hist_retention_days.or(base.hist_retention_days),
        max_clean_up_time_sec: child.max_clean_up_time_sec.or(base.max_clean_up_time_sec),
        max_active_runs: child.max_active_runs.or(base.max_active_runs),
        max_active_steps: child.max_active_steps.or(base.max_active_steps),
        max_output_size: child.max_output_size.or(base.max_output_size),
        preconditions: child.preconditions.or(base.preconditions),
        handler_on: if skip_base_handlers {
            child.handler_on
        } else {
            child.handler_on.or(base.handler_on)
        },
        mail_on: child.mail_on.or(base.mail_on),
        smtp: child.smtp.or(base.smtp),
        error_mail: child.error_mail.or(base.error_mail),
        info_mail: child.info_mail.or(base.info_mail),
        ssh: child.ssh.or(base.ssh),
        container: child.container.or(base.container),
        otel: child.otel.or(base.otel),
        registry_auths: child.registry_auths.or(base.registry_auths),
        secrets: child.secrets.or(base.secrets),
        shell: child.shell.or(base.shell),
        run_config: child.run_config.or(base.run_config),
        worker_selector: child.worker_selector.or(base.worker_selector),
        steps: child.steps,
    }
}

/// Concatenate base and child env entries into one sequence of single-key
/// mappings, preserving order. Shapes the env transformer would reject are
/// passed through untouched so it can report them.
fn merge_env(base: Option<Value>, child: Option<Value>) -> Option<Value> {
    match (base, child) {
        (None, child) => child,
        (base, None) => base,
        (Some(base), Some(child)) => match (env_entries(&base), env_entries(&child)) {
            (Some(mut entries), Some(child_entries)) => {
                entries.extend(child_entries);
                Some(Value::Sequence(entries))
            }
            _ => Some(child),
        },
    }
}

/// Normalize an env value into single-key mapping items.
fn env_entries(value: &Value) -> Option<Vec<Value>> {
    let mut entries = Vec::new();
    match value {
        Value::Mapping(mapping) => {
            for (k, v) in mapping {
                let mut single = serde_yaml::Mapping::new();
                single.insert(k.clone(), v.clone());
                entries.push(Value::Mapping(single));
            }
        }
        Value::Sequence(items) => {
            for item in items {
                if !item.is_mapping() {
                    return None;
                }
                entries.push(item.clone());
            }
        }
        _ => return None,
    }
    Some(entries)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn def(yaml: &str) -> DagDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_scalars_adopted_only_if_unset() {
        let base = def("logDir: /var/log/base\nhistRetentionDays: 7\n");
        let child = def("name: child\nlogDir: /var/log/child\n");
        let merged = merge_defs(base, child, false);
        assert_eq!(merged.log_dir.as_deref(), Some("/var/log/child"));
        assert_eq!(merged.hist_retention_days, Some(7));
    }

    #[test]
    fn test_env_concatenated_base_first() {
        let base = def("env:\n  - SHARED: base\n  - BASE_ONLY: b\n");
        let child = def("name: child\nenv:\n  - SHARED: child\n");
        let merged = merge_defs(base, child, false);
        let entries = merged.env.unwrap();
        let seq = entries.as_sequence().unwrap();
        assert_eq!(seq.len(), 3);
        // base entries come first; the env transformer keeps the last
        // occurrence per key, so the child value wins downstream
    }

    #[test]
    fn test_child_schedule_overrides_wholesale() {
        let base = def("schedule: \"0 1 * * *\"\nstopSchedule: \"0 2 * * *\"\n");
        let child = def("name: child\nschedule: \"0 3 * * *\"\n");
        let merged = merge_defs(base, child, false);
        assert!(merged.schedule.is_some());
        // the base stopSchedule does not survive a child schedule override
        assert!(merged.stop_schedule.is_none());
    }

    #[test]
    fn test_base_steps_never_inherited() {
        let base = def("steps:\n  - echo base\n");
        let child = def("name: child\n");
        let merged = merge_defs(base, child, false);
        assert!(merged.steps.is_none());
    }

    #[test]
    fn test_skip_base_handlers() {
        let base = def("handlerOn:\n  failure:\n    command: echo failed\n");
        let child = def("name: child\n");
        assert!(merge_defs(base.clone(), child.clone(), false)
            .handler_on
            .is_some());
        assert!(merge_defs(base, child, true).handler_on.is_none());
    }
}
