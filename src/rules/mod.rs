//! The rule pipeline: each rule reads a snapshot of the spend graph plus the
//! evaluation context and returns at most one verdict. The engine iterates in
//! fixed order, short-circuits on the first `Deny`, and remembers the first
//! `Flag` to return if no `Deny` occurs.

mod baseline;
mod circular_flow;
mod concentration;
mod new_agent;
mod velocity;

pub use baseline::BaselineRule;
pub use circular_flow::CircularFlowRule;
pub use concentration::CounterpartyConcentrationRule;
pub use new_agent::NewAgentRule;
pub use velocity::VelocityRule;

use chrono::{DateTime, Utc};

use crate::amount::UsdcAmount;
use crate::graph::SpendGraph;
use crate::tier::{Tier, TierLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Flag,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: Action,
    pub rule_name: String,
    pub reason: String,
}

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Verdict {
        Verdict {
            action: Action::Allow,
            rule_name: "none".to_string(),
            reason: reason.into(),
        }
    }

    pub fn flag(rule_name: &'static str, reason: impl Into<String>) -> Verdict {
        Verdict {
            action: Action::Flag,
            rule_name: rule_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn deny(rule_name: &'static str, reason: impl Into<String>) -> Verdict {
        Verdict {
            action: Action::Deny,
            rule_name: rule_name.to_string(),
            reason: reason.into(),
        }
    }
}

/// The inputs a rule needs to judge a single mutating ledger operation.
pub struct EvalContext<'a> {
    pub agent_addr: &'a str,
    pub counterparty: &'a str,
    pub amount: UsdcAmount,
    pub op_type: &'a str,
    pub tier: Tier,
    pub now: DateTime<Utc>,
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, graph: &SpendGraph, ctx: &EvalContext<'_>, limits: &TierLimits) -> Option<Verdict>;
}

/// Ordered pipeline of rules. Order matters: `Deny` short-circuits
/// immediately, the first `Flag` is remembered and returned only if no rule
/// later in the chain denies.
pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    limits: TierLimits,
}

impl RuleEngine {
    pub fn new(limits: TierLimits) -> Self {
        Self {
            rules: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn evaluate(&self, graph: &SpendGraph, ctx: &EvalContext<'_>) -> Verdict {
        let refs: Vec<&dyn Rule> = self.rules.iter().map(|r| r.as_ref()).collect();
        evaluate_pipeline(graph, ctx, &self.limits, &refs)
    }
}

/// Runs an ordered slice of rules: first `Deny` short-circuits, the first
/// `Flag` is remembered and returned only if nothing later denies.
pub fn evaluate_pipeline(
    graph: &SpendGraph,
    ctx: &EvalContext<'_>,
    limits: &TierLimits,
    rules: &[&dyn Rule],
) -> Verdict {
    let mut flagged: Option<Verdict> = None;
    for rule in rules {
        if let Some(verdict) = rule.evaluate(graph, ctx, limits) {
            match verdict.action {
                Action::Deny => return verdict,
                Action::Flag => {
                    if flagged.is_none() {
                        flagged = Some(verdict);
                    }
                }
                Action::Allow => {}
            }
        }
    }
    flagged.unwrap_or_else(|| Verdict::allow("all rules passed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFlag;
    impl Rule for AlwaysFlag {
        fn name(&self) -> &'static str {
            "always_flag"
        }
        fn evaluate(&self, _graph: &SpendGraph, _ctx: &EvalContext<'_>, _limits: &TierLimits) -> Option<Verdict> {
            Some(Verdict::flag("always_flag", "test flag"))
        }
    }

    struct AlwaysDeny;
    impl Rule for AlwaysDeny {
        fn name(&self) -> &'static str {
            "always_deny"
        }
        fn evaluate(&self, _graph: &SpendGraph, _ctx: &EvalContext<'_>, _limits: &TierLimits) -> Option<Verdict> {
            Some(Verdict::deny("always_deny", "test deny"))
        }
    }

    fn ctx() -> EvalContext<'static> {
        EvalContext {
            agent_addr: "a",
            counterparty: "b",
            amount: UsdcAmount::dollars("1"),
            op_type: "spend",
            tier: Tier::Established,
            now: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        }
    }

    #[test]
    fn first_deny_short_circuits() {
        let graph = SpendGraph::new();
        let mut engine = RuleEngine::new(TierLimits::default());
        engine.push(Box::new(AlwaysFlag));
        engine.push(Box::new(AlwaysDeny));
        let verdict = engine.evaluate(&graph, &ctx());
        assert_eq!(verdict.action, Action::Deny);
    }

    #[test]
    fn flag_is_returned_when_nothing_denies() {
        let graph = SpendGraph::new();
        let mut engine = RuleEngine::new(TierLimits::default());
        engine.push(Box::new(AlwaysFlag));
        let verdict = engine.evaluate(&graph, &ctx());
        assert_eq!(verdict.action, Action::Flag);
    }

    #[test]
    fn allow_when_no_rule_fires() {
        let graph = SpendGraph::new();
        let engine = RuleEngine::new(TierLimits::default());
        let verdict = engine.evaluate(&graph, &ctx());
        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(verdict.reason, "all rules passed");
    }
}
