use crate::amount::UsdcAmount;
use crate::graph::SpendGraph;
use crate::rules::{EvalContext, Rule, Verdict};
use crate::tier::{Tier, TierLimits};

const NEW_AGENT_PER_TX_CAP: &str = "5";

/// Per-transaction cap for agents with no reputation history yet.
pub struct NewAgentRule;

impl Rule for NewAgentRule {
    fn name(&self) -> &'static str {
        "new_agent_cap"
    }

    fn evaluate(&self, _graph: &SpendGraph, ctx: &EvalContext<'_>, _limits: &TierLimits) -> Option<Verdict> {
        if ctx.tier != Tier::New {
            return None;
        }
        let cap = UsdcAmount::dollars(NEW_AGENT_PER_TX_CAP);
        if ctx.amount > cap {
            return Some(Verdict::deny(
                self.name(),
                format!(
                    "new agents are capped at ${} per transaction; reduce the amount or contact your operator",
                    cap.format()
                ),
            ));
        }
        None
    }
}
