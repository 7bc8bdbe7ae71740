use std::{collections::HashMap, fmt};

use chrono::{DateTime, Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PassPlan;

/// Who is selling, and where
///
/// Passed explicitly into every purchase instead of being read from session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub store_id: i64,
    pub device_id: i64,
    /// Operator running the till
    pub user_id: i64,
}

/// Accepted ways to pay for a pass
///
/// Payment is only recorded, never processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
}

impl PaymentMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "cash" => Some(PaymentMethod::Cash),
            "card" => Some(PaymentMethod::Card),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
        }
    }
}

/// One line of the POS cart
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    /// SKU of the product being sold
    pub product_code: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// Tags attached to each cart product code
pub type CartTags = HashMap<String, Vec<String>>;

/// Discount applied by the promotion engine to a cart line
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PromoDiscount {
    pub product_code: String,
    pub amount: Decimal,
}

/// Outcome of the promotion engine for the cart
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PromoResult {
    #[serde(default)]
    pub discounts: Vec<PromoDiscount>,
}

/// Fiscal invoice number: a series and a gapless sequence within it
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct InvoiceNumber {
    pub series: String,
    pub number: u64,
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.series, self.number)
    }
}

/// Everything the record writer needs to persist one pass sale
#[derive(Clone, Debug, PartialEq)]
pub struct PassPurchase {
    pub context: RequestContext,
    pub member_id: i64,
    pub payment_method: PaymentMethod,
    pub idempotency_key: String,
    pub invoice: InvoiceNumber,
    pub pass_plan_id: i64,
    pub sale_sku: String,
    pub quantity: u32,
    pub amount: Decimal,
    pub remaining_uses: u32,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: NaiveDate,
}

impl PassPurchase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: RequestContext,
        member_id: i64,
        payment_method: PaymentMethod,
        idempotency_key: String,
        invoice: InvoiceNumber,
        item: &CartItem,
        plan: &PassPlan,
        purchased_at: DateTime<Utc>,
    ) -> Self {
        let expires_at = purchased_at
            .date_naive()
            .checked_add_days(Days::new(plan.validity_days.into()))
            .unwrap_or(NaiveDate::MAX);

        Self {
            context,
            member_id,
            payment_method,
            idempotency_key,
            invoice,
            pass_plan_id: plan.pass_plan_id,
            sale_sku: plan.sale_sku.clone(),
            quantity: item.quantity,
            amount: plan.sale_price * Decimal::from(item.quantity),
            remaining_uses: plan.total_uses,
            purchased_at,
            expires_at,
        }
    }
}

/// Identifiers created by the record writer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassRecords {
    pub order_id: i64,
    pub pass_id: i64,
}

/// Financial record of a committed pass sale
#[derive(Clone, Debug, PartialEq)]
pub struct TopupOrder {
    pub order_id: i64,
    /// Pass created together with this order
    pub pass_id: i64,
    pub context: RequestContext,
    pub member_id: i64,
    pub pass_plan_id: i64,
    pub sale_sku: String,
    pub payment_method: PaymentMethod,
    pub idempotency_key: String,
    pub invoice: InvoiceNumber,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}
