use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Low,
    Mid,
    High,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Low, ModelTier::Mid, ModelTier::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream model and price for one tier. Prices are USD micros per million
/// tokens, so `100_000` is $0.10 / M tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPricing {
    pub model: String,
    pub input_usd_micros_per_mtok: u64,
    pub output_usd_micros_per_mtok: u64,
}

impl TierPricing {
    pub fn new(
        model: impl Into<String>,
        input_usd_micros_per_mtok: u64,
        output_usd_micros_per_mtok: u64,
    ) -> Self {
        Self {
            model: model.into(),
            input_usd_micros_per_mtok,
            output_usd_micros_per_mtok,
        }
    }

    pub fn estimate_cost_usd_micros(&self, input_tokens: u32, output_tokens: u32) -> u64 {
        let micros_times_mtok = u128::from(input_tokens)
            * u128::from(self.input_usd_micros_per_mtok)
            + u128::from(output_tokens) * u128::from(self.output_usd_micros_per_mtok);
        let rounded = (micros_times_mtok + 500_000) / 1_000_000;
        u64::try_from(rounded).unwrap_or(u64::MAX)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_low_tier")]
    pub low: TierPricing,
    #[serde(default = "default_mid_tier")]
    pub mid: TierPricing,
    #[serde(default = "default_high_tier")]
    pub high: TierPricing,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            low: default_low_tier(),
            mid: default_mid_tier(),
            high: default_high_tier(),
        }
    }
}

impl TierTable {
    pub fn pricing(&self, tier: ModelTier) -> &TierPricing {
        match tier {
            ModelTier::Low => &self.low,
            ModelTier::Mid => &self.mid,
            ModelTier::High => &self.high,
        }
    }

    pub fn model_name(&self, tier: ModelTier) -> &str {
        self.pricing(tier).model.as_str()
    }

    pub fn estimate_cost_usd_micros(
        &self,
        tier: ModelTier,
        input_tokens: u32,
        output_tokens: u32,
    ) -> u64 {
        self.pricing(tier)
            .estimate_cost_usd_micros(input_tokens, output_tokens)
    }

    pub fn validate(&self) -> Result<(), String> {
        for tier in ModelTier::ALL {
            if self.model_name(tier).trim().is_empty() {
                return Err(format!("tiers.{tier}.model must not be empty"));
            }
        }
        Ok(())
    }
}

fn default_low_tier() -> TierPricing {
    TierPricing::new("gemini-2.5-flash-lite", 100_000, 400_000)
}

fn default_mid_tier() -> TierPricing {
    TierPricing::new("gemini-2.5-flash", 300_000, 2_500_000)
}

fn default_high_tier() -> TierPricing {
    TierPricing::new("gemini-2.5-pro", 600_000, 10_000_000)
}
