//! Continuity (recurring subscription) plans and the local subscription rows
//! created when a rollover credit is applied to one.

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Week,
    Month,
    Quarter,
    Year,
}

impl BillingInterval {
    /// Processor-side interval name; quarters bill as months.
    pub fn external_interval(&self) -> &'static str {
        match self {
            BillingInterval::Week => "week",
            BillingInterval::Month | BillingInterval::Quarter => "month",
            BillingInterval::Year => "year",
        }
    }

    /// Processor-side interval count for `count` of our intervals.
    pub fn external_interval_count(&self, count: u32) -> u32 {
        match self {
            BillingInterval::Quarter => count.saturating_mul(3),
            _ => count,
        }
    }

    /// End of a billing period of `count` intervals starting at `start`.
    pub fn advance(&self, start: DateTime<Utc>, count: u32) -> DateTime<Utc> {
        let count = count.max(1);
        match self {
            BillingInterval::Week => start + chrono::Duration::weeks(i64::from(count)),
            BillingInterval::Month | BillingInterval::Quarter => {
                let months = self.external_interval_count(count);
                start
                    .checked_add_months(Months::new(months))
                    .unwrap_or(start)
            }
            BillingInterval::Year => start
                .checked_add_months(Months::new(count.saturating_mul(12)))
                .unwrap_or(start),
        }
    }
}

/// Subscription product a rollover credit can be applied against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityPlan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub billing_interval: BillingInterval,
    #[serde(default = "default_interval_count")]
    pub billing_interval_count: u32,
    pub amount_per_interval: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub trial_days: u32,
    #[serde(default)]
    pub stripe_product_id: Option<String>,
    /// Set once the plan has been synced to the payment processor.
    #[serde(default)]
    pub stripe_price_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_interval_count() -> u32 {
    1
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_active() -> bool {
    true
}

impl ContinuityPlan {
    /// Synced plans carry a processor price reference.
    pub fn synced_price_id(&self) -> Option<&str> {
        self.stripe_price_id
            .as_deref()
            .filter(|price| !price.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Paused,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    /// Map a processor status string; anything unrecognized is treated as active.
    pub fn from_external(status: &str) -> Self {
        match status {
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "paused" => SubscriptionStatus::Paused,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete_expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// Local subscription row linking instance, plan and processor subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSubscription {
    pub id: String,
    pub continuity_plan_id: String,
    pub client_email: String,
    pub client_name: Option<String>,
    pub order_id: Option<String>,
    pub guarantee_instance_id: Option<String>,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub credit_remaining: Decimal,
    pub credit_total: Decimal,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_quarter_maps_to_three_months() {
        assert_eq!(BillingInterval::Quarter.external_interval(), "month");
        assert_eq!(BillingInterval::Quarter.external_interval_count(2), 6);
        assert_eq!(BillingInterval::Week.external_interval_count(2), 2);
    }

    #[test]
    fn test_advance() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            BillingInterval::Month.advance(start, 1),
            Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BillingInterval::Quarter.advance(start, 1),
            Utc.with_ymd_and_hms(2026, 4, 30, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BillingInterval::Week.advance(start, 2),
            start + chrono::Duration::weeks(2)
        );
    }

    #[test]
    fn test_synced_price_id_ignores_blank() {
        let mut plan = ContinuityPlan {
            id: "plan-1".into(),
            name: "Inner Circle".into(),
            description: None,
            billing_interval: BillingInterval::Month,
            billing_interval_count: 1,
            amount_per_interval: rust_decimal::Decimal::new(9900, 2),
            currency: "usd".into(),
            trial_days: 0,
            stripe_product_id: None,
            stripe_price_id: Some("  ".into()),
            is_active: true,
        };
        assert!(plan.synced_price_id().is_none());
        plan.stripe_price_id = Some("price_1".into());
        assert_eq!(plan.synced_price_id(), Some("price_1"));
    }

    #[test]
    fn test_subscription_status_from_external() {
        assert_eq!(
            SubscriptionStatus::from_external("trialing"),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            SubscriptionStatus::from_external("incomplete"),
            SubscriptionStatus::Active
        );
    }
}
