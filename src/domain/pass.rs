use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Catalog entry for a purchasable pass
///
/// Plans referenced by a sold pass are never edited, so historical passes keep their meaning.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PassPlan {
    pub pass_plan_id: i64,
    pub name: String,
    pub name_zh: Option<String>,
    pub name_es: Option<String>,
    /// Number of redemptions a sold pass starts with
    pub total_uses: u32,
    /// Days between purchase and expiry
    pub validity_days: u32,
    pub max_uses_per_order: Option<u32>,
    pub max_uses_per_day: Option<u32>,
    pub sale_sku: String,
    pub sale_price: Decimal,
    pub notes: Option<String>,
    pub important_notice_zh: Option<String>,
    pub important_notice_es: Option<String>,
    #[serde(skip)]
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStatus {
    Active,
    Exhausted,
    Expired,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Active => "active",
            PassStatus::Exhausted => "exhausted",
            PassStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "active" => Some(PassStatus::Active),
            "exhausted" => Some(PassStatus::Exhausted),
            "expired" => Some(PassStatus::Expired),
            _ => None,
        }
    }
}

/// A sold, redeemable pass bound to one member
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemberPass {
    pub member_pass_id: i64,
    pub member_id: i64,
    pub pass_plan_id: i64,
    pub remaining_uses: u32,
    pub purchased_at: DateTime<Utc>,
    /// Last day the pass can be redeemed
    pub expires_at: NaiveDate,
    pub topup_order_id: i64,
    pub status: PassStatus,
}

impl MemberPass {
    /// Whether the pass can still be redeemed on `today`
    pub fn is_valid_on(&self, today: NaiveDate) -> bool {
        self.status == PassStatus::Active && self.remaining_uses > 0 && self.expires_at >= today
    }
}
