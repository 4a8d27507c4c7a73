use std::time::Duration;

use crate::graph::SpendGraph;
use crate::rules::{EvalContext, Rule, Verdict};
use crate::tier::TierLimits;

const CIRCULAR_FLOW_WINDOW: Duration = Duration::from_secs(3600);

/// Surfaces circular payment structures as a non-blocking flag; never denies.
pub struct CircularFlowRule;

impl Rule for CircularFlowRule {
    fn name(&self) -> &'static str {
        "circular_flow"
    }

    fn evaluate(&self, graph: &SpendGraph, ctx: &EvalContext<'_>, _limits: &TierLimits) -> Option<Verdict> {
        if ctx.counterparty.is_empty() {
            return None;
        }
        let path = graph.has_cyclic_flow(ctx.agent_addr, CIRCULAR_FLOW_WINDOW, ctx.now)?;
        Some(Verdict::flag(
            self.name(),
            format!("circular flow detected: {}", path.join(" -> ")),
        ))
    }
}
