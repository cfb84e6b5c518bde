//! Conjure Pricing - Deterministic cost quoting
//!
//! A quote is a pure function of (tool definition, normalized inputs,
//! current rate book). Cost models:
//!
//! | Model             | Price                                            |
//! |-------------------|--------------------------------------------------|
//! | static            | declared USD amount                              |
//! | per_unit          | declared rate × unit count from an input field   |
//! | per_backend_second| historical average runtime × GPU-second rate     |
//!
//! Spell quotes are the sum of their steps' quotes under the same bindings;
//! steps whose inputs resolve only at execution time are re-quoted then,
//! bounded by the tool's declared tolerance.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use conjure_types::{
    CostModel, CreditAmount, CreditRate, NormalizedInputs, ToolDefinition, ToolId, UsdAmount,
};

/// Errors in cost quoting
#[derive(Debug, Clone, Error)]
pub enum QuoteError {
    #[error("No GPU-second rate for hardware class '{class}'")]
    UnknownHardwareClass { class: String },

    #[error("No runtime average recorded for tool {tool_id}")]
    MissingRuntimeAverage { tool_id: String },

    #[error("Unit field '{field}' is not a positive integer")]
    InvalidUnitField { field: String },

    #[error("Quote arithmetic overflow")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, QuoteError>;

/// One labelled component of a quote breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteComponent {
    pub label: String,
    pub usd: UsdAmount,
}

/// A priced quote with its breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub usd: UsdAmount,
    pub credits: CreditAmount,
    pub components: Vec<QuoteComponent>,
}

/// Current rates used by the quoter.
///
/// Assembled from configuration and the runtime-average feedback the
/// execution engine records; swapped wholesale on rate updates.
#[derive(Debug, Clone)]
pub struct RateBook {
    pub credit_rate: CreditRate,
    /// Hardware class → USD per GPU-second
    pub gpu_second_rates: HashMap<String, Decimal>,
    /// Tool → historical average backend runtime, seconds
    pub runtime_averages: HashMap<ToolId, f64>,
}

impl RateBook {
    pub fn new(credit_rate: CreditRate) -> Self {
        Self {
            credit_rate,
            gpu_second_rates: HashMap::new(),
            runtime_averages: HashMap::new(),
        }
    }

    pub fn with_gpu_rate(mut self, class: impl Into<String>, usd_per_second: Decimal) -> Self {
        self.gpu_second_rates.insert(class.into(), usd_per_second);
        self
    }

    pub fn with_runtime_average(mut self, tool_id: ToolId, seconds: f64) -> Self {
        self.runtime_averages.insert(tool_id, seconds);
        self
    }
}

/// The cost quoter. Stateless; all inputs are explicit.
pub struct CostQuoter;

impl CostQuoter {
    /// Quote one tool invocation.
    pub fn quote(
        tool: &ToolDefinition,
        inputs: &NormalizedInputs,
        rates: &RateBook,
    ) -> Result<Quote> {
        let (usd, components) = match &tool.cost_model {
            CostModel::Static { usd } => (
                UsdAmount::new(*usd),
                vec![QuoteComponent {
                    label: "base".to_string(),
                    usd: UsdAmount::new(*usd),
                }],
            ),
            CostModel::PerUnit {
                usd_per_unit,
                unit_field,
            } => {
                let units = unit_count(inputs, unit_field)?;
                let usd = usd_per_unit
                    .checked_mul(Decimal::from(units))
                    .ok_or(QuoteError::Overflow)?;
                (
                    UsdAmount::new(usd),
                    vec![QuoteComponent {
                        label: format!("{} x {}", units, unit_field),
                        usd: UsdAmount::new(usd),
                    }],
                )
            }
            CostModel::PerBackendSecond { hardware_class } => {
                let rate = rates
                    .gpu_second_rates
                    .get(hardware_class)
                    .copied()
                    .ok_or_else(|| QuoteError::UnknownHardwareClass {
                        class: hardware_class.clone(),
                    })?;
                let seconds = rates
                    .runtime_averages
                    .get(&tool.id)
                    .copied()
                    .ok_or_else(|| QuoteError::MissingRuntimeAverage {
                        tool_id: tool.id.to_string(),
                    })?;
                let seconds_dec =
                    Decimal::from_f64(seconds).ok_or(QuoteError::Overflow)?;
                let usd = rate
                    .checked_mul(seconds_dec)
                    .ok_or(QuoteError::Overflow)?;
                (
                    UsdAmount::new(usd),
                    vec![QuoteComponent {
                        label: format!("{:.1}s @ {}", seconds, hardware_class),
                        usd: UsdAmount::new(usd),
                    }],
                )
            }
        };

        let credits = rates
            .credit_rate
            .to_credits(usd)
            .map_err(|_| QuoteError::Overflow)?;
        Ok(Quote {
            usd,
            credits,
            components,
        })
    }

    /// Quote a sequence of steps (a spell) under the same bindings.
    pub fn quote_steps(
        steps: &[(&ToolDefinition, NormalizedInputs)],
        rates: &RateBook,
    ) -> Result<Quote> {
        let mut usd = UsdAmount::zero();
        let mut components = Vec::new();
        for (idx, (tool, inputs)) in steps.iter().enumerate() {
            let step_quote = Self::quote(tool, inputs, rates)?;
            usd = usd.checked_add(step_quote.usd).ok_or(QuoteError::Overflow)?;
            components.push(QuoteComponent {
                label: format!("step {} ({})", idx, tool.id),
                usd: step_quote.usd,
            });
        }
        let credits = rates
            .credit_rate
            .to_credits(usd)
            .map_err(|_| QuoteError::Overflow)?;
        Ok(Quote {
            usd,
            credits,
            components,
        })
    }

    /// Whether an execution-time charge stays within the declared tolerance
    /// of the up-front quote.
    pub fn within_tolerance(
        quoted: CreditAmount,
        charged: CreditAmount,
        tolerance: f64,
    ) -> bool {
        if charged <= quoted {
            return true;
        }
        let ceiling = (quoted.0 as f64) * (1.0 + tolerance);
        (charged.0 as f64) <= ceiling
    }
}

fn unit_count(inputs: &NormalizedInputs, field: &str) -> Result<u64> {
    match inputs.get(field) {
        None => Ok(1),
        Some(value) => value
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| QuoteError::InvalidUnitField {
                field: field.to_string(),
            }),
    }
}
