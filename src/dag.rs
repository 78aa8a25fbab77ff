//! DAG analysis: dependency extraction, cycle detection, level assignment,
//! and branch-membership computation for skip propagation.

use crate::errors::EngineError;
use crate::refs::{extract_refs, step_dependency};
use crate::types::Step;
use std::collections::{HashMap, HashSet};

/// The result of analyzing a flat, ordered step list.
#[derive(Debug, Clone)]
pub struct DagPlan {
    /// Step name -> topological level (0-based).
    pub level: HashMap<String, usize>,
    /// Step names grouped by level, ascending; declaration order preserved
    /// within each group.
    pub level_groups: Vec<Vec<String>>,
    /// Step name -> the closest ancestor branch root it belongs to, if any.
    pub branch_membership: HashMap<String, Option<String>>,
}

/// Step names a step depends on: any step-name ref appearing in its input
/// or (if present) its `loop.for.items` ref.
fn dependencies_of(step: &Step, all_names: &HashSet<&str>) -> HashSet<String> {
    let mut deps = HashSet::new();
    for r in extract_refs(&step.input) {
        if let Some(name) = step_dependency(&r) {
            if all_names.contains(name.as_str()) {
                deps.insert(name);
            }
        }
    }
    if let Some(loop_cfg) = &step.config.r#loop {
        if let Some(name) = step_dependency(&loop_cfg.r#for.items) {
            if all_names.contains(name.as_str()) {
                deps.insert(name);
            }
        }
    }
    deps
}

pub struct DagAnalyzer;

impl DagAnalyzer {
    /// Analyze a flat, declaration-ordered step list into a `DagPlan`.
    pub fn analyze(steps: &[Step]) -> Result<DagPlan, EngineError> {
        let all_names: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        if all_names.len() != steps.len() {
            return Err(EngineError::Validation("duplicate step name".to_string()));
        }

        let deps_by_name: HashMap<&str, HashSet<String>> = steps
            .iter()
            .map(|s| (s.name.as_str(), dependencies_of(s, &all_names)))
            .collect();

        let mut level: HashMap<String, usize> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for step in steps {
            Self::level_of(&step.name, &deps_by_name, &mut level, &mut stack)?;
        }

        let max_level = level.values().copied().max().unwrap_or(0);
        let mut level_groups: Vec<Vec<String>> = vec![Vec::new(); max_level + 1];
        for step in steps {
            let lvl = level[&step.name];
            level_groups[lvl].push(step.name.clone());
        }

        let branch_membership = Self::branch_membership(steps, &deps_by_name, &level);

        Ok(DagPlan { level, level_groups, branch_membership })
    }

    /// Memoized DFS: level(s) = 0 if deps(s) is empty, else 1 + max(level of
    /// each dependency). Cycles are detected via `stack`, the path of names
    /// currently being resolved — on a repeat, the slice from its first
    /// occurrence to the top names the actual cycle.
    fn level_of<'a>(
        name: &'a str,
        deps_by_name: &HashMap<&'a str, HashSet<String>>,
        level: &mut HashMap<String, usize>,
        stack: &mut Vec<&'a str>,
    ) -> Result<usize, EngineError> {
        if let Some(&lvl) = level.get(name) {
            return Ok(lvl);
        }
        if let Some(pos) = stack.iter().position(|s| *s == name) {
            let mut cycle: Vec<&str> = stack[pos..].to_vec();
            cycle.push(name);
            return Err(EngineError::Validation(format!(
                "Circular dependency: {}",
                cycle.join(" -> ")
            )));
        }
        stack.push(name);

        let deps = deps_by_name.get(name).cloned().unwrap_or_default();
        let mut max_dep_level: Option<usize> = None;
        for dep in &deps {
            let dep_name: &str = deps_by_name
                .keys()
                .find(|k| **k == dep.as_str())
                .copied()
                .unwrap_or(dep.as_str());
            let dep_level = Self::level_of(dep_name, deps_by_name, level, stack)?;
            max_dep_level = Some(max_dep_level.map_or(dep_level, |m: usize| m.max(dep_level)));
        }

        stack.pop();
        let lvl = max_dep_level.map(|m| m + 1).unwrap_or(0);
        level.insert(name.to_string(), lvl);
        Ok(lvl)
    }

    /// Assign each step to the closest ancestor carrying an `if` (its
    /// branch root), or `None` if no such ancestor exists. Ties (multiple
    /// branch-root ancestors at the same distance — not possible in a DAG
    /// with single predecessors per dependency edge, but reachable via
    /// diamond joins) are broken by DAG depth then declaration order.
    fn branch_membership(
        steps: &[Step],
        deps_by_name: &HashMap<&str, HashSet<String>>,
        level: &HashMap<String, usize>,
    ) -> HashMap<String, Option<String>> {
        let declaration_order: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let has_if: HashSet<&str> = steps
            .iter()
            .filter(|s| s.r#if.is_some())
            .map(|s| s.name.as_str())
            .collect();

        let mut membership: HashMap<String, Option<String>> = HashMap::new();

        // Process in level order so a step's dependencies are already resolved.
        let mut ordered: Vec<&Step> = steps.iter().collect();
        ordered.sort_by_key(|s| level[&s.name]);

        for step in ordered {
            if has_if.contains(step.name.as_str()) {
                // A branch root's own membership is whichever ancestor
                // branch root (if any) dominates it — computed the same way
                // as any other step, from its dependencies.
            }

            let deps = deps_by_name.get(step.name.as_str()).cloned().unwrap_or_default();
            if deps.is_empty() {
                membership.insert(step.name.clone(), None);
                continue;
            }

            // Candidate roots: each dependency is either itself a branch
            // root, or carries its own membership forward.
            let mut candidates: Vec<(String, usize, usize)> = Vec::new(); // (root, depth, decl_order)
            for dep in &deps {
                let root = if has_if.contains(dep.as_str()) {
                    Some(dep.clone())
                } else {
                    membership.get(dep).cloned().flatten()
                };
                if let Some(root) = root {
                    let depth = level[&root];
                    let decl = declaration_order[root.as_str()];
                    candidates.push((root, depth, decl));
                }
            }

            if candidates.is_empty() {
                membership.insert(step.name.clone(), None);
                continue;
            }

            // Closest ancestor = greatest depth; ties by declaration order.
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
            membership.insert(step.name.clone(), Some(candidates[0].0.clone()));
        }

        membership
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Condition, ConditionOperator, Step};
    use serde_json::json;

    fn tool_step(name: &str, input: serde_json::Value) -> Step {
        Step {
            name: name.to_string(),
            action: Action::Code { source: "noop".to_string() },
            input,
            r#if: None,
            config: Default::default(),
        }
    }

    #[test]
    fn linear_chain_levels() {
        let steps = vec![
            tool_step("a", json!({})),
            tool_step("b", json!({"x": "@a.x"})),
            tool_step("c", json!({"y": "@b.y"})),
        ];
        let plan = DagAnalyzer::analyze(&steps).unwrap();
        assert_eq!(plan.level["a"], 0);
        assert_eq!(plan.level["b"], 1);
        assert_eq!(plan.level["c"], 2);
        assert_eq!(plan.level_groups, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn fan_out_join_shares_level() {
        let steps = vec![
            tool_step("root", json!({})),
            tool_step("l1", json!({"v": "@root"})),
            tool_step("l2", json!({"v": "@root"})),
            tool_step("join", json!({"a": "@l1", "b": "@l2"})),
        ];
        let plan = DagAnalyzer::analyze(&steps).unwrap();
        assert_eq!(plan.level["root"], 0);
        assert_eq!(plan.level["l1"], 1);
        assert_eq!(plan.level["l2"], 1);
        assert_eq!(plan.level["join"], 2);
        assert_eq!(plan.level_groups[1], vec!["l1", "l2"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let steps = vec![
            tool_step("a", json!({"v": "@b.x"})),
            tool_step("b", json!({"v": "@a.x"})),
        ];
        let err = DagAnalyzer::analyze(&steps).unwrap_err();
        match err {
            EngineError::Validation(msg) => assert!(msg.contains("Circular dependency")),
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn duplicate_step_name_rejected() {
        let steps = vec![tool_step("a", json!({})), tool_step("a", json!({}))];
        assert!(DagAnalyzer::analyze(&steps).is_err());
    }

    #[test]
    fn branch_membership_propagates_to_descendants() {
        let mut branch = tool_step("branch", json!({"v": "@decide"}));
        branch.r#if = Some(Condition {
            r#ref: "@decide.ok".to_string(),
            operator: ConditionOperator::Eq,
            value: json!(true),
        });
        let steps = vec![
            tool_step("decide", json!({})),
            branch,
            tool_step("leaf", json!({"v": "@branch"})),
        ];
        let plan = DagAnalyzer::analyze(&steps).unwrap();
        assert_eq!(plan.branch_membership["decide"], None);
        assert_eq!(plan.branch_membership["branch"], None);
        assert_eq!(plan.branch_membership["leaf"], Some("branch".to_string()));
    }
}
