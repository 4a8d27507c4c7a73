use crate::graph::SpendGraph;
use crate::rules::{EvalContext, Rule, Verdict};
use crate::tier::TierLimits;

const CONCENTRATION_THRESHOLD_PERCENT: i128 = 80;

/// Flags (never denies) when a single counterparty accounts for more than
/// 80% of an agent's lifetime spend.
pub struct CounterpartyConcentrationRule;

impl Rule for CounterpartyConcentrationRule {
    fn name(&self) -> &'static str {
        "counterparty_concentration"
    }

    fn evaluate(&self, graph: &SpendGraph, ctx: &EvalContext<'_>, _limits: &TierLimits) -> Option<Verdict> {
        if ctx.counterparty.is_empty() {
            return None;
        }
        let node = graph.get_node(ctx.agent_addr, ctx.now)?;
        if node.total_spent.is_zero() {
            return None;
        }
        let edge = graph.get_edge(ctx.agent_addr, ctx.counterparty)?;
        let percent = (100 * edge.volume.minor_units()) / node.total_spent.minor_units();
        if percent > CONCENTRATION_THRESHOLD_PERCENT {
            return Some(Verdict::flag(
                self.name(),
                format!(
                    "{}% of lifetime spend concentrated with counterparty {}",
                    percent, ctx.counterparty
                ),
            ));
        }
        None
    }
}
