//! Product-aware classification rules.
//!
//! `classify` is a pure function of the subject, the threshold version and the
//! threshold values. The same input always yields the same decision and
//! `rule_id`, so the `rule_id` doubles as an audit key: a change in it between
//! two runs means the rules or thresholds moved, not the loan.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::opportunity::rate_delta_bps;
use crate::{Alert, LoanProfile};

pub const RULE_VERSION: &str = "guardian-os-core-v1";
pub const DEFAULT_THRESHOLD_BPS: f64 = 50.0;
/// Fallback benchmark when a product has no dedicated rate.
pub const DEFAULT_BENCHMARK_RATE: f64 = 6.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProductCategory {
    #[serde(rename = "10yr")]
    TenYear,
    #[serde(rename = "15yr")]
    FifteenYear,
    #[serde(rename = "30yr")]
    ThirtyYear,
    #[serde(rename = "30yr_fha")]
    ThirtyYearFha,
    #[serde(rename = "30yr_va")]
    ThirtyYearVa,
    #[serde(rename = "5_1_arm")]
    FiveOneArm,
    #[serde(rename = "7_1_arm")]
    SevenOneArm,
    #[serde(rename = "jumbo")]
    Jumbo,
}

impl ProductCategory {
    pub const ALL: [ProductCategory; 8] = [
        ProductCategory::TenYear,
        ProductCategory::FifteenYear,
        ProductCategory::ThirtyYear,
        ProductCategory::ThirtyYearFha,
        ProductCategory::ThirtyYearVa,
        ProductCategory::FiveOneArm,
        ProductCategory::SevenOneArm,
        ProductCategory::Jumbo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCategory::TenYear => "10yr",
            ProductCategory::FifteenYear => "15yr",
            ProductCategory::ThirtyYear => "30yr",
            ProductCategory::ThirtyYearFha => "30yr_fha",
            ProductCategory::ThirtyYearVa => "30yr_va",
            ProductCategory::FiveOneArm => "5_1_arm",
            ProductCategory::SevenOneArm => "7_1_arm",
            ProductCategory::Jumbo => "jumbo",
        }
    }

    pub fn from_canonical(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    pub fn threshold_key(&self) -> &'static str {
        match self {
            ProductCategory::TenYear => "trigger_threshold_10yr",
            ProductCategory::FifteenYear => "trigger_threshold_15yr",
            ProductCategory::ThirtyYear => "trigger_threshold_30yr",
            ProductCategory::ThirtyYearFha => "trigger_threshold_30yr_fha",
            ProductCategory::ThirtyYearVa => "trigger_threshold_30yr_va",
            ProductCategory::FiveOneArm => "trigger_threshold_5_1_arm",
            ProductCategory::SevenOneArm => "trigger_threshold_7_1_arm",
            ProductCategory::Jumbo => "trigger_threshold_jumbo",
        }
    }

    /// Days before an ARM reset inside which a warning is raised.
    pub fn arm_warning_days(&self) -> Option<i64> {
        match self {
            ProductCategory::FiveOneArm => Some(120),
            ProductCategory::SevenOneArm => Some(150),
            _ => None,
        }
    }

    pub fn benchmark_rate(&self) -> f64 {
        match self {
            ProductCategory::TenYear => 6.05,
            ProductCategory::FifteenYear => 6.10,
            ProductCategory::ThirtyYear => 6.35,
            ProductCategory::ThirtyYearFha => 6.20,
            ProductCategory::ThirtyYearVa => 6.15,
            ProductCategory::FiveOneArm => 6.40,
            ProductCategory::SevenOneArm => 6.25,
            ProductCategory::Jumbo => 6.55,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProductRule {
    pub needles: &'static [&'static str],
    pub category: ProductCategory,
}

/// Substring rules in priority order; anything unmatched is a 30-year fixed.
pub const PRODUCT_RULES: [ProductRule; 7] = [
    ProductRule {
        needles: &["jumbo"],
        category: ProductCategory::Jumbo,
    },
    ProductRule {
        needles: &["fha"],
        category: ProductCategory::ThirtyYearFha,
    },
    ProductRule {
        needles: &["va"],
        category: ProductCategory::ThirtyYearVa,
    },
    ProductRule {
        needles: &["5/1", "5-1"],
        category: ProductCategory::FiveOneArm,
    },
    ProductRule {
        needles: &["7/1", "7-1"],
        category: ProductCategory::SevenOneArm,
    },
    ProductRule {
        needles: &["10"],
        category: ProductCategory::TenYear,
    },
    ProductRule {
        needles: &["15"],
        category: ProductCategory::FifteenYear,
    },
];

/// Map a free-text product label onto a canonical category.
///
/// Labels that already are canonical (`5_1_arm`, `30yr_va`, ...) map to
/// themselves before the substring rules run.
pub fn normalize_product(label: Option<&str>) -> ProductCategory {
    let value = label.unwrap_or_default().trim().to_lowercase();
    if let Some(category) = ProductCategory::from_canonical(&value) {
        return category;
    }
    PRODUCT_RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|n| value.contains(n)))
        .map(|rule| rule.category)
        .unwrap_or(ProductCategory::ThirtyYear)
}

/// Lenient numeric coercion for values coming from env vars or JSON.
pub fn coerce_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | '%') && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// A named snapshot of per-product thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdVersion {
    pub id: String,
    pub version_name: String,
}

/// Raw threshold values keyed by `trigger_threshold_*`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdSet(pub BTreeMap<String, JsonValue>);

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Threshold for `key`, falling back to 50 bps when absent or non-numeric.
    pub fn threshold_bps(&self, key: &str) -> f64 {
        self.0
            .get(key)
            .and_then(coerce_number)
            .unwrap_or(DEFAULT_THRESHOLD_BPS)
    }
}

/// Which intake pipeline produced the record being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeShape {
    /// Flat contact-centric alert, optionally enriched with a loan profile.
    ContactAlert,
    /// Normalized contact/property/loan graph keyed by loan fingerprint.
    NormalizedLoan,
}

/// Common view the rules read, regardless of the record shape.
pub trait ClassificationSubject {
    fn intake_shape(&self) -> IntakeShape;
    fn product_label(&self) -> Option<&str>;
    fn current_rate(&self) -> Option<f64>;
    fn market_rate(&self) -> Option<f64>;
    fn arm_adjustment_date(&self) -> Option<NaiveDate>;
}

impl ClassificationSubject for LoanProfile {
    fn intake_shape(&self) -> IntakeShape {
        IntakeShape::NormalizedLoan
    }

    fn product_label(&self) -> Option<&str> {
        non_blank(self.product_normalized.as_deref()).or(non_blank(self.loan_type_raw.as_deref()))
    }

    fn current_rate(&self) -> Option<f64> {
        finite(self.current_rate)
    }

    fn market_rate(&self) -> Option<f64> {
        finite(self.market_rate)
    }

    fn arm_adjustment_date(&self) -> Option<NaiveDate> {
        self.arm_adjustment_date
    }
}

/// Alert-level facts with an optional loan profile; loan values win.
#[derive(Debug, Clone, Copy)]
pub struct ContactAlertSubject<'a> {
    pub loan_type: Option<&'a str>,
    pub current_rate: Option<f64>,
    pub market_rate: Option<f64>,
    pub loan: Option<&'a LoanProfile>,
}

impl<'a> ContactAlertSubject<'a> {
    pub fn new(alert: &'a Alert, loan: Option<&'a LoanProfile>) -> Self {
        Self {
            loan_type: Some(alert.loan_type.as_str()),
            current_rate: Some(alert.current_rate),
            market_rate: Some(alert.market_rate),
            loan,
        }
    }
}

impl ClassificationSubject for ContactAlertSubject<'_> {
    fn intake_shape(&self) -> IntakeShape {
        IntakeShape::ContactAlert
    }

    fn product_label(&self) -> Option<&str> {
        self.loan
            .and_then(|l| l.product_label())
            .or(non_blank(self.loan_type))
    }

    fn current_rate(&self) -> Option<f64> {
        self.loan
            .and_then(|l| l.current_rate())
            .or(finite(self.current_rate))
    }

    fn market_rate(&self) -> Option<f64> {
        self.loan
            .and_then(|l| l.market_rate())
            .or(finite(self.market_rate))
    }

    fn arm_adjustment_date(&self) -> Option<NaiveDate> {
        self.loan.and_then(|l| l.arm_adjustment_date)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Notify,
    Hold,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Notify => "notify",
            Decision::Hold => "hold",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "notify" => Some(Decision::Notify),
            "hold" => Some(Decision::Hold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Opportunity,
    Warning,
    Hold,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Opportunity => "Opportunity",
            Disposition::Warning => "Warning",
            Disposition::Hold => "Hold",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Opportunity" => Some(Disposition::Opportunity),
            "Warning" => Some(Disposition::Warning),
            "Hold" => Some(Disposition::Hold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSnapshot {
    pub threshold_version_id: String,
    pub threshold_version_name: String,
    pub intake_shape: IntakeShape,
    pub product: ProductCategory,
    pub threshold_key: String,
    pub threshold_bps: f64,
    pub current_rate: f64,
    pub market_rate: f64,
    pub delta_bps: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_to_adjustment: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub opportunity: bool,
    pub decision: Decision,
    pub disposition: Disposition,
    pub reason: String,
    pub rule_id: String,
    pub threshold_snapshot: ThresholdSnapshot,
}

pub fn rule_id(version: &ThresholdVersion, product: ProductCategory) -> String {
    format!(
        "{RULE_VERSION}:{}:{}:{}",
        version.version_name,
        product.as_str(),
        product.threshold_key()
    )
}

/// Classify one subject. `as_of` only matters for the ARM warning window.
pub fn classify<S: ClassificationSubject + ?Sized>(
    subject: &S,
    version: &ThresholdVersion,
    thresholds: &ThresholdSet,
    as_of: NaiveDate,
) -> ClassificationResult {
    let product = normalize_product(subject.product_label());
    let threshold_key = product.threshold_key();
    let threshold_bps = thresholds.threshold_bps(threshold_key);

    let current_rate = subject.current_rate().unwrap_or(0.0);
    let market_rate = subject.market_rate().unwrap_or(0.0);
    let delta_bps = rate_delta_bps(current_rate, market_rate);

    let opportunity = delta_bps as f64 >= threshold_bps;
    let decision = if opportunity {
        Decision::Notify
    } else {
        Decision::Hold
    };

    let days_to_adjustment = product
        .arm_warning_days()
        .and(subject.arm_adjustment_date())
        .map(|date| (date - as_of).num_days());
    let in_arm_window = match (product.arm_warning_days(), days_to_adjustment) {
        (Some(window), Some(days)) => days <= window,
        _ => false,
    };

    let disposition = if opportunity {
        Disposition::Opportunity
    } else if in_arm_window {
        Disposition::Warning
    } else {
        Disposition::Hold
    };

    let mut reason = if opportunity {
        format!(
            "Rate delta {delta_bps}bps exceeds threshold {threshold_bps}bps ({}).",
            product.as_str()
        )
    } else {
        format!(
            "Rate delta {delta_bps}bps is below threshold {threshold_bps}bps ({}).",
            product.as_str()
        )
    };
    if in_arm_window {
        if let Some(days) = days_to_adjustment {
            reason.push_str(&format!(" ARM adjustment in {days} days."));
        }
    }

    ClassificationResult {
        opportunity,
        decision,
        disposition,
        reason,
        rule_id: rule_id(version, product),
        threshold_snapshot: ThresholdSnapshot {
            threshold_version_id: version.id.clone(),
            threshold_version_name: version.version_name.clone(),
            intake_shape: subject.intake_shape(),
            product,
            threshold_key: threshold_key.to_string(),
            threshold_bps,
            current_rate,
            market_rate,
            delta_bps,
            days_to_adjustment,
        },
    }
}
