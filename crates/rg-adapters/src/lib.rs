//! Market rate source contracts + the built-in benchmark implementations.

use async_trait::async_trait;
use rand::Rng;
use rg_core::classify::DEFAULT_BENCHMARK_RATE;
use rg_core::ProductCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rg-adapters";

/// Bound of the uniform jitter applied to the default benchmark.
pub const DEFAULT_JITTER: f64 = 0.10;

#[derive(Debug, Error, PartialEq)]
pub enum RateSourceError {
    #[error("unknown rate source: {0}")]
    UnknownSource(String),
    #[error("invalid fixed rate {0:?}")]
    InvalidRate(String),
    #[error("rate feed unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSourceKind {
    Jitter,
    ProductTable,
    Fixed,
}

/// Supplies the current market benchmark, optionally per product.
#[async_trait]
pub trait RateSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> RateSourceKind;

    async fn current_rate(&self, product: Option<ProductCategory>)
        -> Result<f64, RateSourceError>;
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Single benchmark with bounded uniform jitter, standing in for feed noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitteredBenchmark {
    pub base: f64,
    pub jitter: f64,
}

impl Default for JitteredBenchmark {
    fn default() -> Self {
        Self {
            base: DEFAULT_BENCHMARK_RATE,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl JitteredBenchmark {
    fn sample(&self) -> f64 {
        if self.jitter <= 0.0 {
            return round3(self.base);
        }
        let offset = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        round3(self.base + offset)
    }
}

#[async_trait]
impl RateSource for JitteredBenchmark {
    fn source_id(&self) -> &'static str {
        "jitter"
    }

    fn kind(&self) -> RateSourceKind {
        RateSourceKind::Jitter
    }

    async fn current_rate(
        &self,
        _product: Option<ProductCategory>,
    ) -> Result<f64, RateSourceError> {
        Ok(self.sample())
    }
}

/// Static per-product table; unknown product falls back to the default benchmark.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProductBenchmarkTable;

#[async_trait]
impl RateSource for ProductBenchmarkTable {
    fn source_id(&self) -> &'static str {
        "product-table"
    }

    fn kind(&self) -> RateSourceKind {
        RateSourceKind::ProductTable
    }

    async fn current_rate(
        &self,
        product: Option<ProductCategory>,
    ) -> Result<f64, RateSourceError> {
        Ok(product
            .map(|p| p.benchmark_rate())
            .unwrap_or(DEFAULT_BENCHMARK_RATE))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRate(pub f64);

#[async_trait]
impl RateSource for FixedRate {
    fn source_id(&self) -> &'static str {
        "fixed"
    }

    fn kind(&self) -> RateSourceKind {
        RateSourceKind::Fixed
    }

    async fn current_rate(
        &self,
        _product: Option<ProductCategory>,
    ) -> Result<f64, RateSourceError> {
        Ok(self.0)
    }
}

/// Resolve a source from its configured id: `jitter`, `product-table` or `fixed:<rate>`.
pub fn rate_source_for(source_id: &str) -> Result<Box<dyn RateSource>, RateSourceError> {
    let source_id = source_id.trim();
    match source_id {
        "" | "jitter" => Ok(Box::new(JitteredBenchmark::default())),
        "product-table" => Ok(Box::new(ProductBenchmarkTable)),
        other => match other.strip_prefix("fixed:") {
            Some(raw) => {
                let rate = raw
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|r| r.is_finite() && *r > 0.0)
                    .ok_or_else(|| RateSourceError::InvalidRate(raw.to_string()))?;
                Ok(Box::new(FixedRate(rate)))
            }
            None => Err(RateSourceError::UnknownSource(other.to_string())),
        },
    }
}
