//! Pricing for text jobs.
//!
//! The estimate only looks at the request, so a price can be quoted (and an
//! invoice issued) before any compute runs.

use serde::{Deserialize, Serialize};

/// Price in millisats
pub type Msats = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub msats_per_token: Msats,
    /// Minimum charge in millisats
    pub min_price_msats: Msats,
    /// Maximum charge (cap) in millisats
    pub max_price_msats: Msats,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            msats_per_token: 10,        // 10 msats per token
            min_price_msats: 1_000,     // 1 sat min
            max_price_msats: 1_000_000, // 1k sats max
        }
    }
}

impl PricingConfig {
    /// Charge nothing, for local testing.
    pub fn free() -> Self {
        Self {
            msats_per_token: 0,
            min_price_msats: 0,
            max_price_msats: 0,
        }
    }

    /// Price for a prompt, floored at the minimum and capped at the maximum.
    pub fn quote(&self, prompt: &str) -> Msats {
        let tokens = estimate_tokens(prompt);
        let total = tokens.saturating_mul(self.msats_per_token);

        // Apply min/max bounds
        total.max(self.min_price_msats).min(self.max_price_msats)
    }
}

/// Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // counts characters, not bytes
        assert_eq!(estimate_tokens("ñññññ"), 2);
    }

    #[test]
    fn test_quote_bounds() {
        let pricing = PricingConfig::default();
        assert_eq!(pricing.quote("hi"), 1_000);

        let long = "x".repeat(4_000);
        assert_eq!(pricing.quote(&long), 10_000);

        let huge = "x".repeat(4_000_000);
        assert_eq!(pricing.quote(&huge), 1_000_000);
    }

    #[test]
    fn test_free_pricing() {
        assert_eq!(PricingConfig::free().quote("anything at all"), 0);
    }
}
