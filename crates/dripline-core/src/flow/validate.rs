//! Activation-time flow validation.
//!
//! Everything here fails fast when a flow is activated, so the execution
//! loop only ever sees well-formed graphs. Checks: step configuration
//! completeness, trigger windows, and synchronous cycles (cycles with no
//! intervening Delay or Condition step would spin inside one poll tick).

use std::collections::HashMap;
use std::time::Duration;

use dripline_types::flow::{ConditionSpec, FlowDefinition, StepConfig, TriggerConfig};

use super::FlowError;
use super::graph::{StepGraph, StepTarget};
use crate::engine::step_runner::FIELD_ALLOW_LIST;

/// Validate a flow for activation and return its normalized graph.
///
/// `poll_interval` is the engine's tick interval; date-window triggers
/// narrower than it could double-fire or skip subjects entirely.
pub fn validate_for_activation(
    def: &FlowDefinition,
    poll_interval: Duration,
) -> Result<StepGraph, FlowError> {
    if def.name.trim().is_empty() {
        return Err(FlowError::Validation(
            "flow name must not be empty".to_string(),
        ));
    }

    let graph = StepGraph::normalize(def)?;
    validate_step_configs(&graph)?;
    validate_trigger(&def.trigger, poll_interval)?;
    detect_synchronous_cycles(&graph)?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Step configuration checks
// ---------------------------------------------------------------------------

fn validate_step_configs(graph: &StepGraph) -> Result<(), FlowError> {
    for id in graph.order() {
        let step = graph
            .step(id)
            .expect("order only contains normalized steps");
        match &step.config {
            StepConfig::Message {
                body, template_id, ..
            } => {
                if template_id.is_none() && body.trim().is_empty() {
                    return Err(FlowError::MissingConfig {
                        step: id.clone(),
                        detail: "message has neither inline content nor a template reference"
                            .to_string(),
                    });
                }
            }
            StepConfig::ExternalCall {
                method,
                url,
                response_variable,
                ..
            } => {
                if url.trim().is_empty() {
                    return Err(FlowError::MissingConfig {
                        step: id.clone(),
                        detail: "external call has no URL".to_string(),
                    });
                }
                const METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];
                if !METHODS.contains(&method.to_ascii_uppercase().as_str()) {
                    return Err(FlowError::MissingConfig {
                        step: id.clone(),
                        detail: format!("unsupported HTTP method '{method}'"),
                    });
                }
                if response_variable.trim().is_empty() {
                    return Err(FlowError::MissingConfig {
                        step: id.clone(),
                        detail: "external call has no response variable".to_string(),
                    });
                }
            }
            StepConfig::Action { action } => {
                if let dripline_types::flow::ActionOp::SetField { field, .. } = action {
                    if !FIELD_ALLOW_LIST.contains(&field.as_str()) {
                        return Err(FlowError::MissingConfig {
                            step: id.clone(),
                            detail: format!("field '{field}' is not updatable"),
                        });
                    }
                }
            }
            StepConfig::Condition { condition, .. } => {
                if let ConditionSpec::Engagement {
                    reference_step: Some(reference),
                    ..
                } = condition
                {
                    if graph.step(reference).is_none() {
                        return Err(FlowError::UnknownTarget {
                            step: id.clone(),
                            target: reference.clone(),
                        });
                    }
                }
            }
            StepConfig::Delay { .. } | StepConfig::Trigger {} => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Trigger checks
// ---------------------------------------------------------------------------

fn validate_trigger(trigger: &TriggerConfig, poll_interval: Duration) -> Result<(), FlowError> {
    match trigger {
        TriggerConfig::NewSubject { lookback_minutes }
        | TriggerConfig::AttributeSegment {
            lookback_minutes, ..
        } => {
            if *lookback_minutes <= 0 {
                return Err(FlowError::Trigger(
                    "lookback window must be positive".to_string(),
                ));
            }
            Ok(())
        }
        TriggerConfig::ScheduledDate {
            attribute,
            window_minutes,
            ..
        } => {
            if attribute.trim().is_empty() {
                return Err(FlowError::Trigger(
                    "scheduled-date trigger has no attribute".to_string(),
                ));
            }
            let poll_minutes = poll_interval.as_secs().div_ceil(60) as i64;
            if *window_minutes < poll_minutes {
                return Err(FlowError::Trigger(format!(
                    "scheduled-date window of {window_minutes}m is narrower than the \
                     {poll_minutes}m poll interval; subjects could fire twice or be skipped"
                )));
            }
            Ok(())
        }
        TriggerConfig::External {} | TriggerConfig::Manual {} => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Reject cycles reachable without an intervening Delay or Condition step.
///
/// Such a cycle would loop synchronously inside one tick. Cycles broken by
/// a Delay (which parks the enrollment) or a Condition (which can exit the
/// loop) are allowed; the executor's per-tick step budget bounds them at
/// runtime regardless.
fn detect_synchronous_cycles(graph: &StepGraph) -> Result<(), FlowError> {
    let mut marks: HashMap<&str, Mark> = graph
        .order()
        .iter()
        .map(|id| (id.as_str(), Mark::Unvisited))
        .collect();

    for start in graph.order() {
        if marks[start.as_str()] == Mark::Unvisited {
            visit(graph, start, &mut marks, &mut Vec::new())?;
        }
    }
    Ok(())
}

fn visit<'g>(
    graph: &'g StepGraph,
    id: &'g str,
    marks: &mut HashMap<&'g str, Mark>,
    path: &mut Vec<&'g str>,
) -> Result<(), FlowError> {
    marks.insert(id, Mark::OnPath);
    path.push(id);

    for target in successors(graph, id) {
        match marks.get(target.as_str()).copied() {
            Some(Mark::OnPath) => {
                // Back edge: the cycle is the path suffix from `target`.
                let cycle_start = path
                    .iter()
                    .position(|p| *p == target.as_str())
                    .unwrap_or(0);
                let breaks_tick = path[cycle_start..].iter().any(|step_id| {
                    matches!(
                        graph.step(step_id).map(|s| &s.config),
                        Some(StepConfig::Delay { .. }) | Some(StepConfig::Condition { .. })
                    )
                });
                if !breaks_tick {
                    return Err(FlowError::SynchronousCycle(target.clone()));
                }
            }
            Some(Mark::Unvisited) => visit(graph, marks_key(graph, &target), marks, path)?,
            _ => {}
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}

/// Map a target id back to the graph-owned string slice so the marks map
/// keys share one lifetime.
fn marks_key<'g>(graph: &'g StepGraph, id: &str) -> &'g str {
    graph
        .order()
        .iter()
        .find(|o| o.as_str() == id)
        .map(String::as_str)
        .expect("successor targets are validated step ids")
}

/// All step targets reachable from a step (sequential next + branches).
fn successors(graph: &StepGraph, id: &str) -> Vec<String> {
    let Some(step) = graph.step(id) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if let Some(StepTarget::Step(next)) = &step.next {
        out.push(next.clone());
    }
    for target in step.branches.values() {
        if let StepTarget::Step(t) = target {
            out.push(t.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripline_types::flow::{
        ActionOp, DelaySpec, DelayUnit, EngagementPredicate, FlowEncoding, FlowStatus,
        StepDefinition,
    };
    use uuid::Uuid;

    const POLL: Duration = Duration::from_secs(60);

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

    fn flow(steps: Vec<StepDefinition>, trigger: TriggerConfig) -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: Uuid::now_v7(),
            name: "validate-me".to_string(),
            description: None,
            version: 1,
            status: FlowStatus::Draft,
            trigger,
            encoding: FlowEncoding::Linear { steps },
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn straight_line_flow_validates() {
        let f = flow(
            vec![message_step("a"), message_step("b")],
            TriggerConfig::Manual {},
        );
        let graph = validate_for_activation(&f, POLL).unwrap();
        assert_eq!(graph.entry_step_id(), "a");
    }

    #[test]
    fn synchronous_cycle_rejected() {
        // a -> b -> a with no delay or condition in between.
        let mut steps = vec![message_step("a"), message_step("b")];
        steps[1].next_step_id = Some("a".to_string());
        let f = flow(steps, TriggerConfig::Manual {});
        let err = validate_for_activation(&f, POLL).unwrap_err();
        assert!(matches!(err, FlowError::SynchronousCycle(_)), "got {err}");
    }

    #[test]
    fn cycle_through_delay_is_allowed() {
        let mut steps = vec![
            message_step("a"),
            StepDefinition {
                id: "wait".to_string(),
                name: "wait".to_string(),
                config: StepConfig::Delay {
                    delay: DelaySpec::Interval {
                        amount: 1,
                        unit: DelayUnit::Days,
                    },
                },
                next_step_id: Some("a".to_string()),
            },
        ];
        steps[0].next_step_id = Some("wait".to_string());
        let f = flow(steps, TriggerConfig::Manual {});
        assert!(validate_for_activation(&f, POLL).is_ok());
    }

    #[test]
    fn message_without_content_rejected() {
        let step = StepDefinition {
            id: "empty".to_string(),
            name: "empty".to_string(),
            config: StepConfig::Message {
                subject: String::new(),
                body: String::new(),
                template_id: None,
                continue_thread: false,
                send_only_if_no_reply: false,
                skip_if_opened: false,
            },
            next_step_id: None,
        };
        let f = flow(vec![step], TriggerConfig::Manual {});
        let err = validate_for_activation(&f, POLL).unwrap_err();
        assert!(matches!(err, FlowError::MissingConfig { .. }), "got {err}");
    }

    #[test]
    fn scheduled_date_window_must_cover_poll_interval() {
        let f = flow(
            vec![message_step("a")],
            TriggerConfig::ScheduledDate {
                attribute: "signup_date".to_string(),
                offset_days: 7,
                window_minutes: 1,
            },
        );
        let err = validate_for_activation(&f, Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, FlowError::Trigger(_)), "got {err}");

        let ok = flow(
            vec![message_step("a")],
            TriggerConfig::ScheduledDate {
                attribute: "signup_date".to_string(),
                offset_days: 7,
                window_minutes: 30,
            },
        );
        assert!(validate_for_activation(&ok, Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn set_field_outside_allow_list_rejected() {
        let step = StepDefinition {
            id: "mutate".to_string(),
            name: "mutate".to_string(),
            config: StepConfig::Action {
                action: ActionOp::SetField {
                    field: "password".to_string(),
                    value: "nope".to_string(),
                },
            },
            next_step_id: None,
        };
        let f = flow(vec![step], TriggerConfig::Manual {});
        let err = validate_for_activation(&f, POLL).unwrap_err();
        assert!(err.to_string().contains("not updatable"), "got {err}");
    }

    #[test]
    fn engagement_reference_must_exist() {
        let step = StepDefinition {
            id: "check".to_string(),
            name: "check".to_string(),
            config: StepConfig::Condition {
                condition: ConditionSpec::Engagement {
                    predicate: EngagementPredicate::Opened,
                    reference_step: Some("ghost".to_string()),
                },
                true_branch: vec![],
                false_branch: vec![],
            },
            next_step_id: None,
        };
        let f = flow(vec![message_step("m1"), step], TriggerConfig::Manual {});
        let err = validate_for_activation(&f, POLL).unwrap_err();
        assert!(matches!(err, FlowError::UnknownTarget { .. }), "got {err}");
    }
}
