//! Plan tiers, subscription status, and provider price mapping.

use serde::{Deserialize, Serialize};

/// Subscription tiers. `free` is the default for accounts with no
/// subscription and the fallback when a provider price id is unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanId {
    /// Credits granted per billing period on renewal.
    pub fn monthly_allowance(&self) -> i64 {
        match self {
            PlanId::Free => 10,
            PlanId::Starter => 50,
            PlanId::Pro => 150,
            PlanId::Enterprise => 1000,
        }
    }

    /// Whether the tier may use the priority generation models.
    pub fn allows_priority_models(&self) -> bool {
        matches!(self, PlanId::Pro | PlanId::Enterprise)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::Free => "free",
            PlanId::Starter => "starter",
            PlanId::Pro => "pro",
            PlanId::Enterprise => "enterprise",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanId::Free),
            "starter" => Some(PlanId::Starter),
            "pro" => Some(PlanId::Pro),
            "enterprise" => Some(PlanId::Enterprise),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider subscription lifecycle states.
///
/// `Canceled` and `IncompleteExpired` are absorbing: the account drops back
/// to the free plan and stays there until a new subscription is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
}

impl SubscriptionStatus {
    /// Parse the provider's status string. Unknown strings map to `None`
    /// rather than failing the webhook.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "unpaid" => SubscriptionStatus::Unpaid,
            _ => SubscriptionStatus::None,
        }
    }

    /// True when the state ends the subscription and the account reverts to
    /// the free plan.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Maps provider price ids to plan tiers.
///
/// Price ids are deployment-specific, so they come from the environment.
/// An unmapped price resolves to `free` — the webhook must never fail on a
/// price it does not recognize.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    pub starter_price_id: Option<String>,
    pub pro_price_id: Option<String>,
    pub enterprise_price_id: Option<String>,
}

impl PlanCatalog {
    pub fn from_env() -> Self {
        Self {
            starter_price_id: std::env::var("PRICE_ID_STARTER").ok(),
            pro_price_id: std::env::var("PRICE_ID_PRO").ok(),
            enterprise_price_id: std::env::var("PRICE_ID_ENTERPRISE").ok(),
        }
    }

    pub fn plan_for_price(&self, price_id: &str) -> PlanId {
        let matches = |configured: &Option<String>| {
            configured.as_deref().is_some_and(|p| p == price_id)
        };

        if matches(&self.starter_price_id) {
            PlanId::Starter
        } else if matches(&self.pro_price_id) {
            PlanId::Pro
        } else if matches(&self.enterprise_price_id) {
            PlanId::Enterprise
        } else {
            tracing::warn!(price_id = %price_id, "Unmapped provider price id, defaulting to free plan");
            PlanId::Free
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog {
            starter_price_id: Some("price_starter_m".to_string()),
            pro_price_id: Some("price_pro_m".to_string()),
            enterprise_price_id: Some("price_ent_m".to_string()),
        }
    }

    #[test]
    fn known_prices_map_to_tiers() {
        let c = catalog();
        assert_eq!(c.plan_for_price("price_starter_m"), PlanId::Starter);
        assert_eq!(c.plan_for_price("price_pro_m"), PlanId::Pro);
        assert_eq!(c.plan_for_price("price_ent_m"), PlanId::Enterprise);
    }

    #[test]
    fn unmapped_price_defaults_to_free() {
        assert_eq!(catalog().plan_for_price("price_unknown"), PlanId::Free);
        assert_eq!(PlanCatalog::default().plan_for_price("anything"), PlanId::Free);
    }

    #[test]
    fn pro_allowance_is_150() {
        assert_eq!(PlanId::Pro.monthly_allowance(), 150);
    }

    #[test]
    fn terminal_states_revert_to_free() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
    }

    #[test]
    fn unknown_provider_status_is_none() {
        assert_eq!(
            SubscriptionStatus::from_provider("paused"),
            SubscriptionStatus::None
        );
    }
}
