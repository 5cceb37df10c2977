use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::{NestedEvent, NESTED_END, NESTED_START};
use crate::report::{ReportFormat, ResultAccumulator};

/// Result of routing one reporter event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Folded into an environment's accumulator
    Routed,
    /// No `start` seen for the environment yet
    Dropped,
    /// This event emptied the pending set
    AllComplete,
}

/// Aggregate verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
    /// Transport lost or never established before completion
    Aborted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Aborted => 2,
        }
    }
}

/// Session-scoped environment state.
///
/// Owns one accumulator per environment plus the ordered set of environments
/// still awaited.
pub struct EnvironmentRegistry {
    format: Arc<dyn ReportFormat>,

    /// Accumulators (envId → ResultAccumulator)
    envs: HashMap<String, ResultAccumulator>,

    /// Environment ids in order of their first `start`
    order: Vec<String>,

    /// Environments declared by `set test envs` that have not ended
    pending: Vec<String>,

    declared: bool,
    completed: bool,
}

impl EnvironmentRegistry {
    pub fn new(format: Arc<dyn ReportFormat>) -> Self {
        Self {
            format,
            envs: HashMap::new(),
            order: Vec::new(),
            pending: Vec::new(),
            declared: false,
            completed: false,
        }
    }

    /// Replace the pending set. Later declarations win.
    pub fn declare_pending(&mut self, ids: Vec<String>) {
        if self.declared {
            info!("Replacing pending environments {:?} with {:?}", self.pending, ids);
        }
        if ids.is_empty() {
            warn!("Runner declared no test environments");
        }
        debug!("Pending environments: {:?}", ids);

        self.pending = ids;
        self.declared = true;
    }

    /// Route a reporter event to its environment's accumulator.
    pub fn route(&mut self, event: &NestedEvent) -> RouteOutcome {
        let env_id = event.env_id();

        if event.event == NESTED_START {
            if self.envs.contains_key(env_id) {
                info!(env = env_id, "Environment restarted, discarding previous results");
            } else {
                self.order.push(env_id.to_string());
            }
            self.envs.insert(
                env_id.to_string(),
                ResultAccumulator::new(env_id, self.format.clone()),
            );
        }

        let Some(acc) = self.envs.get_mut(env_id) else {
            debug!(env = env_id, event = %event.event, "Dropping event for unstarted environment");
            return RouteOutcome::Dropped;
        };

        acc.fold(event);

        if event.event != NESTED_END {
            return RouteOutcome::Routed;
        }

        match self.pending.iter().position(|id| id == env_id) {
            Some(idx) => {
                self.pending.remove(idx);
                debug!(env = env_id, remaining = self.pending.len(), "Environment finished");
            }
            None => {
                warn!(env = env_id, "End received for environment that is not pending, ignoring");
                return RouteOutcome::Routed;
            }
        }

        if self.is_complete() && !self.completed {
            self.completed = true;
            return RouteOutcome::AllComplete;
        }

        RouteOutcome::Routed
    }

    /// True once environments were declared and none are left pending.
    ///
    /// An empty declaration satisfies this immediately, but the run is only
    /// finished when [`route`](Self::route) returns [`RouteOutcome::AllComplete`],
    /// which needs an `end` that removes the last pending id.
    pub fn is_complete(&self) -> bool {
        self.declared && self.pending.is_empty()
    }

    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn get(&self, env_id: &str) -> Option<&ResultAccumulator> {
        self.envs.get(env_id)
    }

    /// Known environments in order of their first `start`
    pub fn environments(&self) -> impl Iterator<Item = &ResultAccumulator> {
        self.order.iter().filter_map(|id| self.envs.get(id))
    }

    pub fn run_status(&self) -> RunStatus {
        if self.envs.values().any(|acc| acc.failures() > 0) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NESTED_FAIL, NESTED_PASS};
    use crate::report::ReportStyle;
    use serde_json::{json, Value};

    fn registry() -> EnvironmentRegistry {
        EnvironmentRegistry::new(ReportStyle::Tbpl.format())
    }

    fn event(name: &str, data: Value) -> NestedEvent {
        NestedEvent::new(name, data)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_environment_completes_once() {
        let mut reg = registry();
        reg.declare_pending(ids(&["global"]));

        assert_eq!(reg.route(&event(NESTED_START, json!({}))), RouteOutcome::Routed);
        assert_eq!(
            reg.route(&event(NESTED_PASS, json!({"fullTitle": "a"}))),
            RouteOutcome::Routed
        );
        assert_eq!(
            reg.route(&event(NESTED_FAIL, json!({"fullTitle": "b"}))),
            RouteOutcome::Routed
        );
        assert_eq!(reg.route(&event(NESTED_END, json!({}))), RouteOutcome::AllComplete);

        let acc = reg.get("global").expect("global accumulator");
        assert_eq!(acc.passes(), 1);
        assert_eq!(acc.failures(), 1);
        assert_eq!(reg.run_status(), RunStatus::Failed);

        // A duplicate end must not complete twice.
        assert_eq!(reg.route(&event(NESTED_END, json!({}))), RouteOutcome::Routed);
    }

    #[test]
    fn waits_for_every_declared_environment() {
        let mut reg = registry();
        reg.declare_pending(ids(&["env1", "env2"]));

        let env1 = json!({"testAgentEnvId": "env1"});
        let env2 = json!({"testAgentEnvId": "env2"});

        reg.route(&event(NESTED_START, env1.clone()));
        reg.route(&event(NESTED_PASS, json!({"testAgentEnvId": "env1", "fullTitle": "a"})));
        assert_eq!(reg.route(&event(NESTED_END, env1)), RouteOutcome::Routed);
        assert!(!reg.is_complete());
        assert_eq!(reg.pending(), ["env2"]);

        reg.route(&event(NESTED_START, env2.clone()));
        assert_eq!(reg.route(&event(NESTED_END, env2)), RouteOutcome::AllComplete);
        assert_eq!(reg.run_status(), RunStatus::Passed);
    }

    #[test]
    fn events_before_start_are_dropped() {
        let mut reg = registry();
        reg.declare_pending(ids(&["env1"]));

        let outcome = reg.route(&event(
            NESTED_PASS,
            json!({"testAgentEnvId": "env1", "fullTitle": "a"}),
        ));
        assert_eq!(outcome, RouteOutcome::Dropped);
        assert!(reg.get("env1").is_none());
        assert_eq!(reg.pending(), ["env1"]);

        let outcome = reg.route(&event(NESTED_END, json!({"testAgentEnvId": "env1"})));
        assert_eq!(outcome, RouteOutcome::Dropped);
        assert_eq!(reg.pending(), ["env1"]);
    }

    #[test]
    fn not_complete_before_declaration() {
        let mut reg = registry();
        assert!(!reg.is_complete());

        reg.route(&event(NESTED_START, json!({})));
        assert_eq!(reg.route(&event(NESTED_END, json!({}))), RouteOutcome::Routed);
        assert!(!reg.is_complete());
    }

    #[test]
    fn empty_declaration_never_signals_completion() {
        let mut reg = registry();
        reg.declare_pending(Vec::new());
        assert!(reg.is_complete());

        assert_eq!(reg.route(&event(NESTED_START, json!({}))), RouteOutcome::Routed);
        assert_eq!(reg.route(&event(NESTED_END, json!({}))), RouteOutcome::Routed);
        assert!(reg.pending().is_empty());

        // A later non-empty declaration can still complete the run.
        reg.declare_pending(ids(&["global"]));
        assert!(!reg.is_complete());
        reg.route(&event(NESTED_START, json!({})));
        assert_eq!(reg.route(&event(NESTED_END, json!({}))), RouteOutcome::AllComplete);
    }

    #[test]
    fn end_for_undeclared_environment_is_ignored() {
        let mut reg = registry();
        reg.declare_pending(ids(&["env1"]));

        reg.route(&event(NESTED_START, json!({"testAgentEnvId": "stray"})));
        let outcome = reg.route(&event(NESTED_END, json!({"testAgentEnvId": "stray"})));

        assert_eq!(outcome, RouteOutcome::Routed);
        assert_eq!(reg.pending(), ["env1"]);
    }

    #[test]
    fn restart_resets_accumulator_and_keeps_order() {
        let mut reg = registry();
        reg.declare_pending(ids(&["a", "b"]));

        reg.route(&event(NESTED_START, json!({"testAgentEnvId": "a"})));
        reg.route(&event(NESTED_START, json!({"testAgentEnvId": "b"})));
        reg.route(&event(NESTED_FAIL, json!({"testAgentEnvId": "a", "fullTitle": "x"})));
        reg.route(&event(NESTED_START, json!({"testAgentEnvId": "a"})));

        assert_eq!(reg.get("a").map(|acc| acc.failures()), Some(0));
        let order: Vec<&str> = reg.environments().map(|acc| acc.env_id()).collect();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn later_declaration_replaces_pending() {
        let mut reg = registry();
        reg.declare_pending(ids(&["a", "b"]));
        reg.declare_pending(ids(&["c"]));
        assert_eq!(reg.pending(), ["c"]);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunStatus::Passed.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Aborted.exit_code(), 2);
    }
}
