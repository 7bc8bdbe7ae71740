use std::collections::HashMap;

use crate::{
    domain::{CartItem, CartTags, LocalizedMessage, PassPlan, PromoResult, Violation},
    ports::rules::{Error, RulesPort},
};

/// Tag marking products that cannot be sold as a pass right now
pub const NOT_FOR_SALE_TAG: &str = "pass_not_for_sale";

/// Purchase-limit checks for pass sales
///
/// Product tags come from a static table keyed by product code.
#[derive(Clone, Debug, Default)]
pub struct PurchaseLimits {
    tags: HashMap<String, Vec<String>>,
}

impl PurchaseLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, product_code: impl Into<String>, tag: impl Into<String>) -> Self {
        self.tags
            .entry(product_code.into())
            .or_default()
            .push(tag.into());
        self
    }
}

#[async_trait::async_trait]
impl RulesPort for PurchaseLimits {
    async fn get_cart_item_tags(&self, cart: &[CartItem]) -> Result<CartTags, Error> {
        Ok(cart
            .iter()
            .filter_map(|item| {
                self.tags
                    .get(&item.product_code)
                    .map(|tags| (item.product_code.clone(), tags.clone()))
            })
            .collect())
    }

    fn validate_purchase_order(
        &self,
        cart: &[CartItem],
        tags: &CartTags,
        promo: &PromoResult,
        plan: &PassPlan,
    ) -> Result<(), Error> {
        for item in cart {
            // A pass is one card per sale
            if item.quantity != 1 {
                return Err(Error::Violation(Violation::new(
                    "PASS_QUANTITY_LIMIT",
                    LocalizedMessage::new(
                        "每笔订单只能购买一张优惠卡。",
                        "Solo se puede comprar una tarjeta promocional por pedido.",
                    ),
                )));
            }

            if tags
                .get(&item.product_code)
                .is_some_and(|t| t.iter().any(|tag| tag == NOT_FOR_SALE_TAG))
            {
                return Err(Error::Violation(Violation::new(
                    "PASS_NOT_FOR_SALE",
                    LocalizedMessage::new(
                        format!("优惠卡 {} 暂停销售。", plan.name),
                        format!("La tarjeta {} no está a la venta en este momento.", plan.name),
                    ),
                )));
            }

            if promo
                .discounts
                .iter()
                .any(|d| d.product_code == item.product_code && !d.amount.is_zero())
            {
                return Err(Error::Violation(Violation::new(
                    "PASS_PROMOTION_NOT_ALLOWED",
                    LocalizedMessage::new(
                        "优惠卡不能与其他优惠同时使用。",
                        "Las tarjetas promocionales no se pueden combinar con otras promociones.",
                    ),
                )));
            }
        }

        Ok(())
    }
}
