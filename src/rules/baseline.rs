use std::sync::Arc;

use crate::amount::UsdcAmount;
use crate::graph::SpendGraph;
use crate::rules::{EvalContext, Rule, Verdict};
use crate::store::BaselineCache;
use crate::tier::TierLimits;

const STDDEV_FLOOR_RATIO_PERCENT: i128 = 20;
const STDDEV_FLOOR_MINIMUM: &str = "1";
const THRESHOLD_STDDEV_MULTIPLIER: i128 = 3;

/// Denies when projected hourly spend exceeds a learned per-agent threshold
/// derived from the cached baseline. Only installed once a baseline store is
/// wired; otherwise `VelocityRule` alone governs.
pub struct BaselineRule {
    cache: Arc<BaselineCache>,
}

impl BaselineRule {
    pub fn new(cache: Arc<BaselineCache>) -> Self {
        Self { cache }
    }
}

impl Rule for BaselineRule {
    fn name(&self) -> &'static str {
        "baseline_anomaly"
    }

    fn evaluate(&self, graph: &SpendGraph, ctx: &EvalContext<'_>, limits: &TierLimits) -> Option<Verdict> {
        let baseline = self.cache.get(ctx.agent_addr)?;
        if !baseline.is_valid() {
            return None;
        }

        let floor_minimum = UsdcAmount::dollars(STDDEV_FLOOR_MINIMUM);
        let ratio_floor = UsdcAmount::from_minor_units(
            baseline.hourly_mean.minor_units() * STDDEV_FLOOR_RATIO_PERCENT / 100,
        );
        let effective_stddev = baseline
            .hourly_stddev
            .max(ratio_floor)
            .max(floor_minimum);

        let threshold = baseline
            .hourly_mean
            .checked_add(&UsdcAmount::from_minor_units(
                effective_stddev.minor_units() * THRESHOLD_STDDEV_MULTIPLIER,
            ))
            .unwrap_or(baseline.hourly_mean);

        let tier_floor = UsdcAmount::from_minor_units(limits.hourly_velocity_limit(ctx.tier).minor_units() / 2);
        let floor_applied = tier_floor > threshold;
        let effective_threshold = threshold.max(tier_floor);

        let node = graph.get_node(ctx.agent_addr, ctx.now);
        let current_hourly = node.map(|n| n.window_1hour).unwrap_or(UsdcAmount::ZERO);
        let projected = current_hourly.checked_add(&ctx.amount)?;

        if projected > effective_threshold {
            return Some(Verdict::deny(
                self.name(),
                format!(
                    "projected hourly spend ${} exceeds learned threshold ${} (mean ${}, stddev ${}{}); reduce hourly spend or contact your operator",
                    projected.format(),
                    effective_threshold.format(),
                    baseline.hourly_mean.format(),
                    baseline.hourly_stddev.format(),
                    if floor_applied { ", tier floor applied" } else { "" },
                ),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Action;
    use crate::store::AgentBaseline;
    use crate::tier::Tier;
    use chrono::{DateTime, Utc};

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(seconds, 0).unwrap()
    }

    fn rule_with_baseline(mean: &str, stddev: &str, sample_hours: u32) -> BaselineRule {
        let cache = Arc::new(BaselineCache::new());
        cache.merge(vec![AgentBaseline {
            agent_addr: "a".to_string(),
            hourly_mean: UsdcAmount::dollars(mean),
            hourly_stddev: UsdcAmount::dollars(stddev),
            sample_hours,
            last_updated: at(0),
        }]);
        BaselineRule::new(cache)
    }

    #[test]
    fn no_verdict_without_enough_sample_hours() {
        let graph = SpendGraph::new();
        let rule = rule_with_baseline("20", "1", 10);
        let limits = TierLimits::default();
        let ctx = EvalContext {
            agent_addr: "a",
            counterparty: "",
            amount: UsdcAmount::dollars("100"),
            op_type: "hold",
            tier: Tier::New,
            now: at(0),
        };
        assert!(rule.evaluate(&graph, &ctx, &limits).is_none());
    }

    #[test]
    fn denies_with_floor_protection_applied() {
        // mean=$20 stddev=$1 tier=new (hourly limit $50, floor $25).
        // 8x $4 holds => $32 1-hour total, effective threshold max($32, $25)=$32... wait recompute.
        let graph = SpendGraph::new();
        for i in 0..8 {
            graph.record_event("a", "", UsdcAmount::dollars("4"), at(i));
        }
        let rule = rule_with_baseline("20", "1", 48);
        let limits = TierLimits::default();
        let ctx = EvalContext {
            agent_addr: "a",
            counterparty: "",
            amount: UsdcAmount::dollars("4"),
            op_type: "hold",
            tier: Tier::New,
            now: at(8),
        };
        let verdict = rule.evaluate(&graph, &ctx, &limits).unwrap();
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.rule_name, "baseline_anomaly");
    }

    #[test]
    fn allows_when_projection_within_threshold() {
        let graph = SpendGraph::new();
        let rule = rule_with_baseline("1000", "100", 48);
        let limits = TierLimits::default();
        let ctx = EvalContext {
            agent_addr: "a",
            counterparty: "",
            amount: UsdcAmount::dollars("10"),
            op_type: "hold",
            tier: Tier::Established,
            now: at(0),
        };
        assert!(rule.evaluate(&graph, &ctx, &limits).is_none());
    }
}
