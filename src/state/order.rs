use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Fulfilled,
    Refunded,
    Canceled,
}

/// The purchase a guarantee hangs off. Only the fields the engine touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_email: String,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    /// Payment-processor transaction reference a refund is issued against.
    #[serde(default)]
    pub stripe_payment_intent_id: Option<String>,
}

impl Order {
    pub fn payment_reference(&self) -> Option<&str> {
        self.stripe_payment_intent_id
            .as_deref()
            .filter(|r| !r.trim().is_empty())
    }

    pub fn mark_refunded(&mut self) {
        self.status = OrderStatus::Refunded;
    }
}

/// Single-use fixed-value discount code minted for credit payouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCode {
    pub id: String,
    pub code: String,
    pub discount_value: Decimal,
    pub max_uses: u32,
    pub times_used: u32,
    /// Mint-time product restriction. Always None for guarantee codes.
    pub applicable_product_ids: Option<Vec<String>>,
    /// Services the code is meant for; enforced by redemption, not here.
    pub intended_service_ids: Option<Vec<String>>,
    pub guarantee_instance_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl DiscountCode {
    /// Never redeemed and still active: safe to hand out again after a retry.
    pub fn is_unused(&self) -> bool {
        self.is_active && self.times_used == 0
    }
}
