//! Reputation tier normalization and tier-indexed limit tables.

use crate::amount::UsdcAmount;

/// A closed, exhaustively-matched reputation tier. Raw tier strings from the
/// external reputation provider are normalized into this enum at the single
/// gateway `Tier::from_provider_result` and never handled as strings again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    New,
    Emerging,
    Established,
    Trusted,
    Elite,
}

impl Tier {
    /// Fail-closed gateway from the reputation provider's raw output.
    ///
    /// - provider error => `New` (most restrictive valid tier)
    /// - provider returned no tier string, or an unrecognized one => `Established`
    pub fn from_provider_result(result: Option<Result<&str, ()>>) -> Tier {
        match result {
            None => Tier::Established,
            Some(Err(())) => Tier::New,
            Some(Ok(raw)) => Tier::from_str_or_default(raw),
        }
    }

    fn from_str_or_default(raw: &str) -> Tier {
        match raw {
            "new" => Tier::New,
            "emerging" => Tier::Emerging,
            "established" => Tier::Established,
            "trusted" => Tier::Trusted,
            "elite" => Tier::Elite,
            _ => Tier::Established,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::New => "new",
            Tier::Emerging => "emerging",
            Tier::Established => "established",
            Tier::Trusted => "trusted",
            Tier::Elite => "elite",
        }
    }
}

/// Hourly velocity ceiling and concurrency ceiling per tier. Overridable via
/// `SupervisorConfig`; `TierLimits::default()` reproduces the hardcoded table.
#[derive(Debug, Clone)]
pub struct TierLimits {
    hourly_velocity: [UsdcAmount; 5],
    concurrency: [u32; 5],
}

impl TierLimits {
    fn index(tier: Tier) -> usize {
        match tier {
            Tier::New => 0,
            Tier::Emerging => 1,
            Tier::Established => 2,
            Tier::Trusted => 3,
            Tier::Elite => 4,
        }
    }

    pub fn hourly_velocity_limit(&self, tier: Tier) -> UsdcAmount {
        self.hourly_velocity[Self::index(tier)]
    }

    pub fn concurrency_limit(&self, tier: Tier) -> u32 {
        self.concurrency[Self::index(tier)]
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            hourly_velocity: [
                UsdcAmount::dollars("50"),
                UsdcAmount::dollars("500"),
                UsdcAmount::dollars("5000"),
                UsdcAmount::dollars("25000"),
                UsdcAmount::dollars("100000"),
            ],
            concurrency: [3, 10, 25, 50, 100],
        }
    }
}
