//! Opportunity calculator: rate delta, savings, breakeven, score and tier for
//! one contact against one market rate.

use serde::{Deserialize, Serialize};

pub const DEFAULT_LOAN_AMOUNT: f64 = 350_000.0;
/// Assumed premium over market when a contact carries no usable rate.
pub const EXISTING_RATE_PREMIUM: f64 = 0.5;
/// Coarse global gate; per-product thresholds apply downstream.
pub const ELIGIBILITY_FLOOR_BPS: i64 = 25;
pub const SAVINGS_HORIZON_MONTHS: f64 = 36.0;
pub const CLOSING_COST_BASIS: f64 = 3000.0;

/// Round half up, matching the rounding used by the downstream systems.
pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

/// Spread in percentage points times 100. Both rates are percentages.
pub fn rate_delta_bps(existing_rate: f64, market_rate: f64) -> i64 {
    round_half_up((existing_rate - market_rate) * 100.0) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
    D,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
            Tier::D => "D",
        }
    }

    /// Higher is better.
    pub fn rank(&self) -> u8 {
        match self {
            Tier::A => 4,
            Tier::B => 3,
            Tier::C => 2,
            Tier::D => 1,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Tier::A),
            "B" => Some(Tier::B),
            "C" => Some(Tier::C),
            "D" => Some(Tier::D),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierRule {
    pub tier: Tier,
    pub min_score: u32,
    pub min_monthly_savings: f64,
}

/// Evaluated top to bottom; first match wins, anything else is [`Tier::D`].
pub const TIER_RULES: [TierRule; 3] = [
    TierRule {
        tier: Tier::A,
        min_score: 80,
        min_monthly_savings: 500.0,
    },
    TierRule {
        tier: Tier::B,
        min_score: 60,
        min_monthly_savings: 250.0,
    },
    TierRule {
        tier: Tier::C,
        min_score: 40,
        min_monthly_savings: 100.0,
    },
];

pub fn derive_tier(score: u32, monthly_savings: f64) -> Tier {
    TIER_RULES
        .iter()
        .find(|rule| score >= rule.min_score || monthly_savings >= rule.min_monthly_savings)
        .map(|rule| rule.tier)
        .unwrap_or(Tier::D)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityEstimate {
    pub market_rate: f64,
    pub existing_rate: f64,
    pub loan_amount: f64,
    pub rate_delta_bps: i64,
    pub monthly_savings: f64,
    pub total_savings: f64,
    pub breakeven_months: u32,
    pub score: u32,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpportunityCheck {
    Eligible(OpportunityEstimate),
    BelowFloor {
        rate_delta_bps: i64,
        loan_amount: f64,
    },
}

impl OpportunityCheck {
    pub fn estimate(&self) -> Option<&OpportunityEstimate> {
        match self {
            OpportunityCheck::Eligible(est) => Some(est),
            OpportunityCheck::BelowFloor { .. } => None,
        }
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Run the calculator for one contact's loan state.
pub fn evaluate(
    existing_rate: Option<f64>,
    loan_amount: Option<f64>,
    market_rate: f64,
) -> OpportunityCheck {
    let existing_rate = positive(existing_rate).unwrap_or(market_rate + EXISTING_RATE_PREMIUM);
    let loan_amount = positive(loan_amount).unwrap_or(DEFAULT_LOAN_AMOUNT);

    let rate_delta = existing_rate - market_rate;
    let rate_delta_bps = rate_delta_bps(existing_rate, market_rate);
    if loan_amount <= 0.0 || rate_delta_bps <= ELIGIBILITY_FLOOR_BPS {
        return OpportunityCheck::BelowFloor {
            rate_delta_bps,
            loan_amount,
        };
    }

    let monthly_savings = ((rate_delta / 100.0) * loan_amount / 12.0).max(0.0);
    let total_savings = monthly_savings * SAVINGS_HORIZON_MONTHS;
    let breakeven_months = if monthly_savings > 0.0 {
        round_half_up(CLOSING_COST_BASIS / monthly_savings) as u32
    } else {
        0
    };
    let score = round_half_up(rate_delta_bps as f64 / 10.0 + monthly_savings / 10.0).clamp(0.0, 100.0)
        as u32;
    let tier = derive_tier(score, monthly_savings);

    OpportunityCheck::Eligible(OpportunityEstimate {
        market_rate,
        existing_rate,
        loan_amount,
        rate_delta_bps,
        monthly_savings,
        total_savings,
        breakeven_months,
        score,
        tier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eligible(check: OpportunityCheck) -> OpportunityEstimate {
        match check {
            OpportunityCheck::Eligible(est) => est,
            other => panic!("expected an opportunity, got {other:?}"),
        }
    }

    #[test]
    fn delta_uses_percentage_point_convention() {
        assert_eq!(rate_delta_bps(6.5, 5.7), 80);
        assert_eq!(rate_delta_bps(7.125, 6.0), 113);
        assert_eq!(rate_delta_bps(5.0, 6.0), -100);
    }

    #[test]
    fn reference_contact_lands_in_tier_c() {
        let est = eligible(evaluate(Some(6.5), Some(350_000.0), 5.7));
        assert_eq!(est.rate_delta_bps, 80);
        assert!((est.monthly_savings - 233.333).abs() < 0.01);
        assert!((est.total_savings - est.monthly_savings * 36.0).abs() < 1e-9);
        assert_eq!(est.breakeven_months, 13);
        assert_eq!(est.score, 31);
        assert_eq!(est.tier, Tier::C);
    }

    #[test]
    fn floor_is_strictly_greater_than_25_bps() {
        assert!(matches!(
            evaluate(Some(6.25), Some(300_000.0), 6.0),
            OpportunityCheck::BelowFloor { rate_delta_bps: 25, .. }
        ));
        let est = eligible(evaluate(Some(6.26), Some(300_000.0), 6.0));
        assert_eq!(est.rate_delta_bps, 26);
    }

    #[test]
    fn missing_or_invalid_inputs_use_defaults() {
        let est = eligible(evaluate(None, None, 6.0));
        assert_eq!(est.existing_rate, 6.5);
        assert_eq!(est.loan_amount, DEFAULT_LOAN_AMOUNT);
        assert_eq!(est.rate_delta_bps, 50);

        let est = eligible(evaluate(Some(-1.0), Some(-20.0), 6.0));
        assert_eq!(est.existing_rate, 6.5);
        assert_eq!(est.loan_amount, DEFAULT_LOAN_AMOUNT);

        let est = eligible(evaluate(Some(f64::NAN), Some(f64::INFINITY), 6.0));
        assert_eq!(est.existing_rate, 6.5);
        assert_eq!(est.loan_amount, DEFAULT_LOAN_AMOUNT);
    }

    #[test]
    fn score_is_capped_at_100() {
        let est = eligible(evaluate(Some(9.0), Some(2_000_000.0), 6.0));
        assert_eq!(est.score, 100);
        assert_eq!(est.tier, Tier::A);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(derive_tier(80, 0.0), Tier::A);
        assert_eq!(derive_tier(0, 500.0), Tier::A);
        assert_eq!(derive_tier(79, 499.99), Tier::B);
        assert_eq!(derive_tier(60, 0.0), Tier::B);
        assert_eq!(derive_tier(0, 250.0), Tier::B);
        assert_eq!(derive_tier(40, 0.0), Tier::C);
        assert_eq!(derive_tier(0, 100.0), Tier::C);
        assert_eq!(derive_tier(39, 99.99), Tier::D);
    }

    #[test]
    fn tier_is_monotonic_in_score_and_savings() {
        for savings in [0.0, 50.0, 100.0, 180.0, 250.0, 400.0, 500.0, 900.0] {
            let mut previous = 0;
            for score in 0..=100 {
                let rank = derive_tier(score, savings).rank();
                assert!(rank >= previous, "score {score} savings {savings}");
                previous = rank;
            }
        }
        for score in [0, 39, 40, 59, 60, 79, 80, 100] {
            let mut previous = 0;
            for cents in (0..=60_000).step_by(500) {
                let rank = derive_tier(score, cents as f64 / 100.0).rank();
                assert!(rank >= previous, "score {score} savings {cents}c");
                previous = rank;
            }
        }
    }
}
