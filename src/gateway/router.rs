use serde::{Deserialize, Serialize};

use super::RandomSource;
use super::costing::ModelTier;

/// Probability of picking the mid and high tiers once the message is complex
/// enough for them; a ratio of exactly 0 never selects that tier.
///
/// `Low` is the fallback whenever neither upgrade is drawn, so it is picked
/// even when `low` is 0. The field is kept for plan readability and range
/// validation only.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierRatios {
    #[serde(default = "default_low_ratio")]
    pub low: f64,
    #[serde(default)]
    pub mid: f64,
    #[serde(default)]
    pub high: f64,
}

fn default_low_ratio() -> f64 {
    1.0
}

impl Default for TierRatios {
    fn default() -> Self {
        Self {
            low: 1.0,
            mid: 0.0,
            high: 0.0,
        }
    }
}

impl TierRatios {
    pub fn new(low: f64, mid: f64, high: f64) -> Self {
        Self { low, mid, high }
    }

    pub fn only(tier: ModelTier) -> Self {
        match tier {
            ModelTier::Low => Self::new(1.0, 0.0, 0.0),
            ModelTier::Mid => Self::new(0.0, 1.0, 0.0),
            ModelTier::High => Self::new(0.0, 0.0, 1.0),
        }
    }

    pub fn ratio(&self, tier: ModelTier) -> f64 {
        match tier {
            ModelTier::Low => self.low,
            ModelTier::Mid => self.mid,
            ModelTier::High => self.high,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for tier in ModelTier::ALL {
            let ratio = self.ratio(tier);
            if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
                return Err(format!("tier ratio for {tier} must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

pub const HIGH_TIER_MIN_SCORE: f64 = 0.8;
pub const MID_TIER_MIN_SCORE: f64 = 0.4;

const COMPLEX_KEYWORDS: &[&str] = &[
    "explain",
    "compare",
    "optimize",
    "algorithm",
    "why",
    "how",
    "difference",
    "analyze",
    "debug",
    "refactor",
    "implement",
    "explique",
    "détaille",
    "analyse",
    "différence",
    "pourquoi",
    "comment",
    "optimise",
    "améliore",
    "résous",
    "code",
    "programme",
    "script",
    "fonction",
    "algorithme",
];

const SYMBOL_CHARS: &[char] = &['+', '=', '*', '/', '^', '$', '%', '#'];

/// Deterministic complexity score in `[0, 1]`.
pub fn complexity(text: &str) -> f64 {
    let mut score: f64 = 0.0;

    let chars = text.chars().count();
    if chars > 500 {
        score += 0.20;
    }
    if chars > 1000 {
        score += 0.10;
    }

    if text.contains('`') {
        score += 0.25;
    }

    let lowered = text.to_lowercase();
    if lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| COMPLEX_KEYWORDS.contains(&word))
    {
        score += 0.20;
    }

    if !text.is_ascii() {
        score += 0.10;
    }

    if text.contains(SYMBOL_CHARS) {
        score += 0.15;
    }

    score.min(1.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RouteDecision {
    pub tier: ModelTier,
    pub score: f64,
    pub draw: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ModelRouter;

impl ModelRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn select_tier(
        &self,
        text: &str,
        ratios: &TierRatios,
        random: &dyn RandomSource,
    ) -> ModelTier {
        self.route(text, ratios, random).tier
    }

    pub fn route(
        &self,
        text: &str,
        ratios: &TierRatios,
        random: &dyn RandomSource,
    ) -> RouteDecision {
        let score = complexity(text);
        let draw = random.next_f64();
        RouteDecision {
            tier: tier_for(score, ratios, draw),
            score,
            draw,
        }
    }
}

/// Tier for a score and a uniform draw in `[0, 1)`. Falls back to `Low`
/// regardless of `ratios.low`.
pub fn tier_for(score: f64, ratios: &TierRatios, draw: f64) -> ModelTier {
    if score > HIGH_TIER_MIN_SCORE && ratios.high > 0.0 && draw < ratios.high {
        ModelTier::High
    } else if score > MID_TIER_MIN_SCORE && ratios.mid > 0.0 && draw < ratios.mid {
        ModelTier::Mid
    } else {
        ModelTier::Low
    }
}
