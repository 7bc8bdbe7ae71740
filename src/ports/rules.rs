use crate::domain::{CartItem, CartTags, PassPlan, PromoResult, Violation};

/// Pre-purchase business rules
#[mockall::automock]
#[async_trait::async_trait]
pub trait RulesPort {
    async fn get_cart_item_tags(&self, cart: &[CartItem]) -> Result<CartTags, Error>;
    /// Runs before anything is written; a violation aborts the purchase
    fn validate_purchase_order(
        &self,
        cart: &[CartItem],
        tags: &CartTags,
        promo: &PromoResult,
        plan: &PassPlan,
    ) -> Result<(), Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("purchase rejected: {0}")]
    Violation(Violation),

    /// Concrete adapter errors
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
