//! Plan catalog.
//!
//! Plans are configuration, not persisted state. A plan with a zero price is
//! listed but cannot be purchased.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};

/// A purchasable credit bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Stable code, e.g. `REGULAR`.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Price in VND.
    pub price: u64,
    /// Chat credits granted on purchase.
    pub chat_credits: u64,
    /// Quiz-generation credits granted on purchase.
    pub quiz_gen_credits: u64,
    /// Validity in months from the purchase time.
    pub duration_months: u32,
}

impl Plan {
    /// Whether the plan can be bought.
    #[must_use]
    pub fn is_purchasable(&self) -> bool {
        self.price > 0
    }
}

/// The set of plans known to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    /// Build a catalog from a list of plans.
    #[must_use]
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// Look up a plan by code (case-insensitive).
    #[must_use]
    pub fn get(&self, code: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.code.eq_ignore_ascii_case(code))
    }

    /// Look up a plan that can be bought.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown code, `InvalidAmount` for a free plan.
    pub fn purchasable(&self, code: &str) -> Result<&Plan> {
        let plan = self
            .get(code)
            .ok_or_else(|| BillingError::not_found("plan", code))?;
        if !plan.is_purchasable() {
            return Err(BillingError::InvalidAmount(format!(
                "plan {} is not purchasable",
                plan.code
            )));
        }
        Ok(plan)
    }

    /// All plans.
    #[must_use]
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(vec![
            Plan {
                code: "FREE".into(),
                name: "Free".into(),
                price: 0,
                chat_credits: 10,
                quiz_gen_credits: 0,
                duration_months: 0,
            },
            Plan {
                code: "REGULAR".into(),
                name: "Regular".into(),
                price: 159_000,
                chat_credits: 100,
                quiz_gen_credits: 0,
                duration_months: 12,
            },
            Plan {
                code: "STUDENT".into(),
                name: "Student".into(),
                price: 249_000,
                chat_credits: 100,
                quiz_gen_credits: 20,
                duration_months: 12,
            },
        ])
    }
}
