use crate::graph::SpendGraph;
use crate::rules::{EvalContext, Rule, Verdict};
use crate::tier::TierLimits;

/// Tier-indexed hourly ceiling. Denies if the requested amount would push
/// the agent's trailing 1-hour spend over its tier's limit. Allows (returns
/// nothing) for agents with no graph node yet — there is no history to
/// project against.
pub struct VelocityRule;

impl Rule for VelocityRule {
    fn name(&self) -> &'static str {
        "velocity"
    }

    fn evaluate(&self, graph: &SpendGraph, ctx: &EvalContext<'_>, limits: &TierLimits) -> Option<Verdict> {
        let node = graph.get_node(ctx.agent_addr, ctx.now)?;
        let limit = limits.hourly_velocity_limit(ctx.tier);
        let projected = node.window_1hour.checked_add(&ctx.amount)?;
        if projected > limit {
            return Some(Verdict::deny(
                self.name(),
                format!(
                    "hourly spend of ${} would exceed the ${} {} tier limit; reduce hourly spend or contact your operator",
                    projected.format(),
                    limit.format(),
                    ctx.tier.as_str(),
                ),
            ));
        }
        None
    }
}
