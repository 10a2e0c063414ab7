//! Step graph normalization.
//!
//! Both flow encodings (linear array, node/edge graph) resolve to the same
//! abstract `StepGraph` before the engine runs. A normalized step carries a
//! single sequential `next` target plus a map of labeled branch targets;
//! the reserved id `END` becomes `StepTarget::End`.

use std::collections::{HashMap, HashSet};

use dripline_types::flow::{
    END_TARGET, FlowDefinition, FlowEdge, FlowEncoding, StepConfig, StepDefinition,
};

use super::FlowError;

// ---------------------------------------------------------------------------
// Targets and normalized steps
// ---------------------------------------------------------------------------

/// Where control flow goes after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTarget {
    /// Another step in the same flow.
    Step(String),
    /// Terminate the enrollment as completed.
    End,
}

impl StepTarget {
    fn parse(raw: &str) -> Self {
        if raw == END_TARGET {
            StepTarget::End
        } else {
            StepTarget::Step(raw.to_string())
        }
    }
}

/// A step with its control-flow pointers resolved.
#[derive(Debug, Clone)]
pub struct NormalizedStep {
    pub id: String,
    pub name: String,
    pub config: StepConfig,
    /// Sequential successor (explicit edge, `next_step_id`, or array order).
    pub next: Option<StepTarget>,
    /// Labeled branch targets (Condition steps).
    pub branches: HashMap<String, StepTarget>,
}

// ---------------------------------------------------------------------------
// StepGraph
// ---------------------------------------------------------------------------

/// The normalized, executable form of a flow.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: HashMap<String, NormalizedStep>,
    /// Dispatchable steps in definition order; the positional fallback for
    /// branches with no configured target.
    order: Vec<String>,
    entry_step_id: String,
}

impl StepGraph {
    /// Normalize a flow definition in either encoding.
    ///
    /// Rejects duplicate step ids, unknown targets, conflicting edges, and
    /// flows without a dispatchable entry step. Cycle detection is a
    /// separate activation-time pass (`flow::validate`).
    pub fn normalize(def: &FlowDefinition) -> Result<Self, FlowError> {
        match &def.encoding {
            FlowEncoding::Linear { steps } => Self::from_linear(steps),
            FlowEncoding::Graph { nodes, edges } => Self::from_graph(nodes, edges),
        }
    }

    /// The step the engine starts at for a fresh enrollment.
    pub fn entry_step_id(&self) -> &str {
        &self.entry_step_id
    }

    pub fn step(&self, id: &str) -> Option<&NormalizedStep> {
        self.steps.get(id)
    }

    /// Dispatchable step ids in definition order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Sequential successor of a step, if any.
    pub fn next_target(&self, step_id: &str) -> Option<&StepTarget> {
        self.steps.get(step_id).and_then(|s| s.next.as_ref())
    }

    /// Resolve a branch label to a target.
    ///
    /// Fallback chain when the label has no configured target: the step's
    /// sequential `next`, then the positional successor. `None` means the
    /// flow is exhausted and the enrollment completes. An unconfigured
    /// branch falling through is the deliberate default, not an error.
    pub fn resolve_branch(&self, step_id: &str, label: &str) -> Option<StepTarget> {
        let step = self.steps.get(step_id)?;
        if let Some(target) = step.branches.get(label) {
            return Some(target.clone());
        }
        if let Some(next) = &step.next {
            return Some(next.clone());
        }
        self.positional_successor(step_id)
            .map(|id| StepTarget::Step(id.to_string()))
    }

    /// The step after `step_id` in definition order.
    pub fn positional_successor(&self, step_id: &str) -> Option<&str> {
        let idx = self.order.iter().position(|id| id == step_id)?;
        self.order.get(idx + 1).map(String::as_str)
    }

    /// The nearest Message step preceding `step_id` in definition order.
    /// Engagement conditions without an explicit `reference_step` resolve
    /// against this step.
    pub fn default_reference_step(&self, step_id: &str) -> Option<&str> {
        let idx = self.order.iter().position(|id| id == step_id)?;
        self.order[..idx]
            .iter()
            .rev()
            .find(|id| {
                matches!(
                    self.steps.get(id.as_str()).map(|s| &s.config),
                    Some(StepConfig::Message { .. })
                )
            })
            .map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // Linear encoding
    // -----------------------------------------------------------------------

    fn from_linear(steps: &[StepDefinition]) -> Result<Self, FlowError> {
        check_unique_ids(steps)?;

        let dispatchable: Vec<&StepDefinition> = steps
            .iter()
            .filter(|s| !matches!(s.config, StepConfig::Trigger {}))
            .collect();

        let known: HashSet<&str> = dispatchable.iter().map(|s| s.id.as_str()).collect();
        let order: Vec<String> = dispatchable.iter().map(|s| s.id.clone()).collect();

        let mut normalized = HashMap::with_capacity(dispatchable.len());
        for (idx, step) in dispatchable.iter().enumerate() {
            let next = match &step.next_step_id {
                Some(raw) => {
                    let target = StepTarget::parse(raw);
                    check_target(&known, &step.id, &target)?;
                    Some(target)
                }
                None => order.get(idx + 1).map(|id| StepTarget::Step(id.clone())),
            };

            let branches = linear_branches(&known, step)?;

            normalized.insert(
                step.id.clone(),
                NormalizedStep {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    config: step.config.clone(),
                    next,
                    branches,
                },
            );
        }

        let entry_step_id = order.first().cloned().ok_or(FlowError::NoEntryStep)?;

        Ok(Self {
            steps: normalized,
            order,
            entry_step_id,
        })
    }

    // -----------------------------------------------------------------------
    // Graph encoding
    // -----------------------------------------------------------------------

    fn from_graph(nodes: &[StepDefinition], edges: &[FlowEdge]) -> Result<Self, FlowError> {
        check_unique_ids(nodes)?;

        let all_ids: HashSet<&str> = nodes.iter().map(|s| s.id.as_str()).collect();
        let dispatchable: Vec<&StepDefinition> = nodes
            .iter()
            .filter(|s| !matches!(s.config, StepConfig::Trigger {}))
            .collect();
        let order: Vec<String> = dispatchable.iter().map(|s| s.id.clone()).collect();

        // Resolve edges into per-node next/branch pointers.
        let mut nexts: HashMap<&str, StepTarget> = HashMap::new();
        let mut branches: HashMap<&str, HashMap<String, StepTarget>> = HashMap::new();
        let mut has_incoming: HashSet<&str> = HashSet::new();

        for edge in edges {
            if !all_ids.contains(edge.source.as_str()) {
                return Err(FlowError::UnknownTarget {
                    step: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
            let target = StepTarget::parse(&edge.target);
            if let StepTarget::Step(id) = &target {
                match all_ids.get(id.as_str()) {
                    Some(known) => {
                        has_incoming.insert(*known);
                    }
                    None => {
                        return Err(FlowError::UnknownTarget {
                            step: edge.source.clone(),
                            target: edge.target.clone(),
                        });
                    }
                }
            }

            match &edge.source_handle {
                Some(label) => {
                    let slot = branches.entry(edge.source.as_str()).or_default();
                    if slot.insert(label.clone(), target).is_some() {
                        return Err(FlowError::Validation(format!(
                            "step '{}' has multiple edges for branch '{label}'",
                            edge.source
                        )));
                    }
                }
                None => {
                    if nexts.insert(edge.source.as_str(), target).is_some() {
                        return Err(FlowError::Validation(format!(
                            "step '{}' has multiple sequential edges",
                            edge.source
                        )));
                    }
                }
            }
        }

        // Entry: the trigger node's sequential edge, or the unique root.
        let trigger_next = nodes
            .iter()
            .find(|n| matches!(n.config, StepConfig::Trigger {}))
            .and_then(|n| nexts.get(n.id.as_str()));

        let entry_step_id = match trigger_next {
            Some(StepTarget::Step(id)) => id.clone(),
            Some(StepTarget::End) | None => {
                // No trigger node (or it points at END): fall back to the
                // first dispatchable node without an incoming edge, then to
                // plain node order.
                dispatchable
                    .iter()
                    .find(|n| !has_incoming.contains(n.id.as_str()))
                    .or_else(|| dispatchable.first())
                    .map(|n| n.id.clone())
                    .ok_or(FlowError::NoEntryStep)?
            }
        };

        let mut normalized = HashMap::with_capacity(dispatchable.len());
        for step in &dispatchable {
            normalized.insert(
                step.id.clone(),
                NormalizedStep {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    config: step.config.clone(),
                    next: nexts.remove(step.id.as_str()),
                    branches: branches.remove(step.id.as_str()).unwrap_or_default(),
                },
            );
        }

        Ok(Self {
            steps: normalized,
            order,
            entry_step_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_unique_ids(steps: &[StepDefinition]) -> Result<(), FlowError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            return Err(FlowError::DuplicateStepId(step.id.clone()));
        }
    }
    Ok(())
}

fn check_target(known: &HashSet<&str>, step: &str, target: &StepTarget) -> Result<(), FlowError> {
    if let StepTarget::Step(id) = target {
        if !known.contains(id.as_str()) {
            return Err(FlowError::UnknownTarget {
                step: step.to_string(),
                target: id.clone(),
            });
        }
    }
    Ok(())
}

/// Resolve a linear Condition step's branch-target lists into labeled
/// targets. An empty list stays unconfigured (fall through to positional
/// next at execution time).
fn linear_branches(
    known: &HashSet<&str>,
    step: &StepDefinition,
) -> Result<HashMap<String, StepTarget>, FlowError> {
    let StepConfig::Condition {
        true_branch,
        false_branch,
        ..
    } = &step.config
    else {
        return Ok(HashMap::new());
    };

    let mut branches = HashMap::new();
    for (label, targets) in [("true", true_branch), ("false", false_branch)] {
        match targets.as_slice() {
            [] => {}
            [raw] => {
                let target = StepTarget::parse(raw);
                check_target(known, &step.id, &target)?;
                branches.insert(label.to_string(), target);
            }
            _ => {
                return Err(FlowError::Validation(format!(
                    "condition step '{}' has multiple targets for branch '{label}'",
                    step.id
                )));
            }
        }
    }
    Ok(branches)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripline_types::flow::{
        ConditionSpec, DelaySpec, DelayUnit, EngagementPredicate, FlowStatus, TriggerConfig,
    };
    use uuid::Uuid;

    fn message_step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Message {
                subject: "Hi".to_string(),
                body: "Hello".to_string(),
                template_id: None,
                continue_thread: false,
                send_only_if_no_reply: false,
                skip_if_opened: false,
            },
            next_step_id: None,
        }
    }

    fn delay_step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Delay {
                delay: DelaySpec::Interval {
                    amount: 1,
                    unit: DelayUnit::Days,
                },
            },
            next_step_id: None,
        }
    }

    fn condition_step(id: &str, true_branch: Vec<&str>, false_branch: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Condition {
                condition: ConditionSpec::Engagement {
                    predicate: EngagementPredicate::Opened,
                    reference_step: None,
                },
                true_branch: true_branch.into_iter().map(String::from).collect(),
                false_branch: false_branch.into_iter().map(String::from).collect(),
            },
            next_step_id: None,
        }
    }

    fn linear_flow(steps: Vec<StepDefinition>) -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: Uuid::now_v7(),
            name: "test-flow".to_string(),
            description: None,
            version: 1,
            status: FlowStatus::Draft,
            trigger: TriggerConfig::Manual {},
            encoding: FlowEncoding::Linear { steps },
            created_at: now,
            updated_at: now,
        }
    }

    fn graph_flow(nodes: Vec<StepDefinition>, edges: Vec<FlowEdge>) -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: Uuid::now_v7(),
            name: "test-graph".to_string(),
            description: None,
            version: 1,
            status: FlowStatus::Draft,
            trigger: TriggerConfig::Manual {},
            encoding: FlowEncoding::Graph { nodes, edges },
            created_at: now,
            updated_at: now,
        }
    }

    fn edge(source: &str, target: &str, handle: Option<&str>) -> FlowEdge {
        FlowEdge {
            source: source.to_string(),
            target: target.to_string(),
            source_handle: handle.map(String::from),
        }
    }

    // -------------------------------------------------------------------
    // Linear normalization
    // -------------------------------------------------------------------

    #[test]
    fn linear_positional_next() {
        let flow = linear_flow(vec![message_step("a"), delay_step("b"), message_step("c")]);
        let graph = StepGraph::normalize(&flow).unwrap();

        assert_eq!(graph.entry_step_id(), "a");
        assert_eq!(
            graph.next_target("a"),
            Some(&StepTarget::Step("b".to_string()))
        );
        assert_eq!(
            graph.next_target("b"),
            Some(&StepTarget::Step("c".to_string()))
        );
        assert_eq!(graph.next_target("c"), None);
    }

    #[test]
    fn linear_explicit_next_overrides_position() {
        let mut steps = vec![message_step("a"), message_step("b"), message_step("c")];
        steps[0].next_step_id = Some("c".to_string());
        let graph = StepGraph::normalize(&linear_flow(steps)).unwrap();
        assert_eq!(
            graph.next_target("a"),
            Some(&StepTarget::Step("c".to_string()))
        );
    }

    #[test]
    fn linear_condition_branches_resolved() {
        let flow = linear_flow(vec![
            message_step("m1"),
            condition_step("check", vec!["m2"], vec!["END"]),
            message_step("m2"),
        ]);
        let graph = StepGraph::normalize(&flow).unwrap();

        assert_eq!(
            graph.resolve_branch("check", "true"),
            Some(StepTarget::Step("m2".to_string()))
        );
        assert_eq!(graph.resolve_branch("check", "false"), Some(StepTarget::End));
    }

    #[test]
    fn linear_unconfigured_branch_falls_through_positionally() {
        // Only the true branch is configured; a false outcome advances to
        // the positional next rather than completing.
        let flow = linear_flow(vec![
            message_step("m1"),
            condition_step("check", vec!["m2"], vec![]),
            message_step("m2"),
        ]);
        let graph = StepGraph::normalize(&flow).unwrap();

        assert_eq!(
            graph.resolve_branch("check", "false"),
            Some(StepTarget::Step("m2".to_string()))
        );
    }

    #[test]
    fn linear_duplicate_ids_rejected() {
        let flow = linear_flow(vec![message_step("a"), message_step("a")]);
        let err = StepGraph::normalize(&flow).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn linear_unknown_branch_target_rejected() {
        let flow = linear_flow(vec![
            message_step("m1"),
            condition_step("check", vec!["nowhere"], vec![]),
        ]);
        let err = StepGraph::normalize(&flow).unwrap_err();
        assert!(matches!(err, FlowError::UnknownTarget { .. }));
    }

    #[test]
    fn linear_empty_flow_has_no_entry() {
        let flow = linear_flow(vec![]);
        assert!(matches!(
            StepGraph::normalize(&flow),
            Err(FlowError::NoEntryStep)
        ));
    }

    #[test]
    fn default_reference_step_is_nearest_preceding_message() {
        let flow = linear_flow(vec![
            message_step("m1"),
            delay_step("wait"),
            condition_step("check", vec![], vec![]),
        ]);
        let graph = StepGraph::normalize(&flow).unwrap();
        assert_eq!(graph.default_reference_step("check"), Some("m1"));
        assert_eq!(graph.default_reference_step("m1"), None);
    }

    // -------------------------------------------------------------------
    // Graph normalization
    // -------------------------------------------------------------------

    fn trigger_node() -> StepDefinition {
        StepDefinition {
            id: "entry".to_string(),
            name: "Trigger".to_string(),
            config: StepConfig::Trigger {},
            next_step_id: None,
        }
    }

    #[test]
    fn graph_edges_resolve_to_next_and_branches() {
        let flow = graph_flow(
            vec![
                trigger_node(),
                message_step("m1"),
                condition_step("check", vec![], vec![]),
                message_step("m2"),
            ],
            vec![
                edge("entry", "m1", None),
                edge("m1", "check", None),
                edge("check", "m2", Some("true")),
                edge("check", "END", Some("false")),
            ],
        );
        let graph = StepGraph::normalize(&flow).unwrap();

        assert_eq!(graph.entry_step_id(), "m1");
        assert_eq!(
            graph.next_target("m1"),
            Some(&StepTarget::Step("check".to_string()))
        );
        assert_eq!(
            graph.resolve_branch("check", "true"),
            Some(StepTarget::Step("m2".to_string()))
        );
        assert_eq!(graph.resolve_branch("check", "false"), Some(StepTarget::End));
        // Trigger pseudo-step is not dispatchable.
        assert!(graph.step("entry").is_none());
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn graph_without_trigger_uses_unique_root() {
        let flow = graph_flow(
            vec![message_step("m1"), message_step("m2")],
            vec![edge("m1", "m2", None)],
        );
        let graph = StepGraph::normalize(&flow).unwrap();
        assert_eq!(graph.entry_step_id(), "m1");
    }

    #[test]
    fn graph_duplicate_sequential_edges_rejected() {
        let flow = graph_flow(
            vec![message_step("m1"), message_step("m2"), message_step("m3")],
            vec![edge("m1", "m2", None), edge("m1", "m3", None)],
        );
        let err = StepGraph::normalize(&flow).unwrap_err();
        assert!(err.to_string().contains("multiple sequential edges"));
    }

    #[test]
    fn graph_edge_to_unknown_node_rejected() {
        let flow = graph_flow(vec![message_step("m1")], vec![edge("m1", "ghost", None)]);
        assert!(matches!(
            StepGraph::normalize(&flow),
            Err(FlowError::UnknownTarget { .. })
        ));
    }
}
