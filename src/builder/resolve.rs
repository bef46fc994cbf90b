//! # Dependency Resolver
//!
//! Runs after all steps are built:
//!
//! 1. rewrite id references in `depends` to step names
//! 2. in chain mode, give each step without explicit dependencies the
//!    previous sibling group as its predecessors
//! 3. check reference validity and run Kahn's algorithm for cycles

use std::collections::{HashMap, VecDeque};

use crate::dag::{Dag, DagType};
use crate::errors::BuildError;

use super::BuildContext;

pub(crate) fn resolve_dependencies(ctx: &mut BuildContext, dag: &mut Dag) {
    substitute_ids(dag);
    if dag.dag_type == DagType::Chain {
        apply_chain_dependencies(ctx, dag);
    }
    check_graph(ctx, dag);
}

/// Steps may be referenced by id; the graph itself is name-keyed.
fn substitute_ids(dag: &mut Dag) {
    let id_to_name: HashMap<String, String> = dag
        .steps
        .iter()
        .filter_map(|s| s.id.clone().map(|id| (id, s.name.clone())))
        .collect();
    for step in &mut dag.steps {
        for dep in &mut step.depends {
            if let Some(name) = id_to_name.get(dep) {
                *dep = name.clone();
            }
        }
    }
}

/// Walk groups in source order; a step that neither declared `depends`
/// nor opted out with `[]` inherits the previous group.
fn apply_chain_dependencies(ctx: &BuildContext, dag: &mut Dag) {
    let mut last_group: Vec<String> = Vec::new();
    for group in &ctx.step_groups {
        for name in group {
            let Some(step) = dag.steps.iter_mut().find(|s| &s.name == name) else {
                continue;
            };
            if step.depends.is_empty() && !step.explicitly_no_deps {
                step.depends = last_group.clone();
            }
        }
        if !group.is_empty() {
            last_group = group.clone();
        }
    }
}

/// Kahn's algorithm over the name-keyed adjacency; unknown references and
/// cycles become build errors.
fn check_graph(ctx: &mut BuildContext, dag: &Dag) {
    let index_of: HashMap<&str, usize> = dag
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); dag.steps.len()];
    let mut in_degree: Vec<usize> = vec![0; dag.steps.len()];
    for (i, step) in dag.steps.iter().enumerate() {
        for dep in &step.depends {
            match index_of.get(dep.as_str()) {
                Some(&from) => {
                    dependents[from].push(i);
                    in_degree[i] += 1;
                }
                None => ctx.errors.push(
                    format!("steps[{}].depends", i),
                    BuildError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    },
                ),
            }
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut visited = 0usize;
    while let Some(current) = queue.pop_front() {
        visited += 1;
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited < dag.steps.len() {
        // Every unvisited step sits on or behind a cycle; report the first
        // one in source order for a stable message.
        if let Some((i, step)) = dag
            .steps
            .iter()
            .enumerate()
            .find(|(i, _)| in_degree[*i] > 0)
        {
            ctx.errors.push(
                format!("steps[{}].depends", i),
                BuildError::CycleDetected(step.name.clone()),
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
