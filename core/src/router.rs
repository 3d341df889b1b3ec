// Engine Router implementation
use crate::config::UsageLimits;
use crate::ledger::UsageRecord;
use crate::settings::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Weight applied when a user picks the fallback while the primary is still available
pub const FALLBACK_DISCOUNT: f64 = 0.5;

/// Routing target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Route {
    Speak(RoutingDecision),
    /// Hard cap reached; drop without billing
    Drop,
}

/// Routing decision result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub engine: Engine,
    /// Primary budget exhausted; user asked for the primary
    pub forced_fallback: bool,
    pub cost_multiplier: f64,
    pub reason: String,
}

impl RoutingDecision {
    /// Ledger cost of an utterance, counted in Unicode scalar values
    pub fn cost_of(&self, text: &str) -> f64 {
        text.chars().count() as f64 * self.cost_multiplier
    }
}

/// Engine Router core
///
/// Pure function of the usage record, the user's preference and the guild's
/// exemption; it never touches the ledger.
#[derive(Debug, Clone, Copy)]
pub struct EngineRouter {
    limits: UsageLimits,
}

impl EngineRouter {
    pub fn new(limits: UsageLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> UsageLimits {
        self.limits
    }

    pub fn limit_exceeded(&self, usage: &UsageRecord, exempt: bool) -> bool {
        !exempt && self.limits.total_limit > 0.0 && usage.cost >= self.limits.total_limit
    }

    pub fn primary_exhausted(&self, usage: &UsageRecord, exempt: bool) -> bool {
        !exempt && self.limits.primary_threshold > 0.0 && usage.cost >= self.limits.primary_threshold
    }

    /// Route an utterance
    pub fn decide(&self, usage: &UsageRecord, preference: Engine, exempt: bool) -> Route {
        if self.limit_exceeded(usage, exempt) {
            debug!(target = "router", cost = usage.cost, "Usage limit exceeded; dropping");
            return Route::Drop;
        }

        let exhausted = self.primary_exhausted(usage, exempt);
        let decision = match (preference, exhausted) {
            (Engine::Fallback, false) => RoutingDecision {
                engine: Engine::Fallback,
                forced_fallback: false,
                cost_multiplier: FALLBACK_DISCOUNT,
                reason: "User prefers fallback while primary is available".to_string(),
            },
            (Engine::Fallback, true) => RoutingDecision {
                engine: Engine::Fallback,
                forced_fallback: false,
                cost_multiplier: 1.0,
                reason: "User prefers fallback; primary budget exhausted".to_string(),
            },
            (Engine::Primary, true) => RoutingDecision {
                engine: Engine::Fallback,
                forced_fallback: true,
                cost_multiplier: 1.0,
                reason: "Primary budget exhausted".to_string(),
            },
            (Engine::Primary, false) => RoutingDecision {
                engine: Engine::Primary,
                forced_fallback: false,
                cost_multiplier: 1.0,
                reason: "Primary available".to_string(),
            },
        };
        Route::Speak(decision)
    }

    /// True when charging `decision` moved the total from below the primary
    /// threshold to at or above it
    pub fn crossed_threshold(&self, before: f64, after: f64, decision: &RoutingDecision) -> bool {
        let threshold = self.limits.primary_threshold;
        decision.engine == Engine::Primary && threshold > 0.0 && before < threshold && after >= threshold
    }
}
