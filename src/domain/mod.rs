use std::{borrow::Cow, fmt};

use serde::Serialize;

mod member;
mod pass;
mod purchase;

pub(crate) use member::format_timestamp;
pub use member::{mask_phone, normalize_date, normalize_timestamp, Member, MemberRow, NewMember};
pub use pass::{MemberPass, PassPlan, PassStatus};
pub use purchase::{
    CartItem, CartTags, InvoiceNumber, PassPurchase, PassRecords, PaymentMethod, PromoDiscount,
    PromoResult, RequestContext, TopupOrder,
};

/// User-facing text for both storefront languages
///
/// Operators read either Chinese or Spanish, so every member-facing rejection carries both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LocalizedMessage {
    pub zh: Cow<'static, str>,
    pub es: Cow<'static, str>,
}

impl LocalizedMessage {
    pub fn new(zh: impl Into<Cow<'static, str>>, es: impl Into<Cow<'static, str>>) -> Self {
        Self {
            zh: zh.into(),
            es: es.into(),
        }
    }
}

/// A business rule rejected the request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Stable machine-readable code, e.g. `PHONE_MISMATCH`
    pub code: Cow<'static, str>,
    pub message: LocalizedMessage,
}

impl Violation {
    pub fn new(code: impl Into<Cow<'static, str>>, message: LocalizedMessage) -> Self {
        Self {
            code: code.into(),
            message,
        }
    }

    /// The secondary phone confirmation does not belong to the resolved member
    pub fn phone_mismatch() -> Self {
        Self::new(
            "PHONE_MISMATCH",
            LocalizedMessage::new(
                "二次输入的手机号与当前登录会员不一致。如需更换会员，请先退出当前会员，再用正确手机号登录后重新购买。",
                "El número de teléfono introducido en la segunda verificación no coincide con el miembro actualmente conectado. Si desea cambiar de cliente, primero cierre la sesión del miembro actual y vuelva a iniciar sesión con el número correcto antes de realizar la compra.",
            ),
        )
    }

    /// Passes can only be paid in cash or by card
    pub fn unsupported_payment_method() -> Self {
        Self::new(
            "UNSUPPORTED_PAYMENT_METHOD",
            LocalizedMessage::new(
                "购买优惠卡仅支持现金或银行卡支付，请更改支付方式。",
                "La compra de tarjetas promocionales solo admite efectivo o tarjeta bancaria. Por favor, cambie el método de pago.",
            ),
        )
    }

    pub fn no_active_shift() -> Self {
        Self::new(
            "NO_ACTIVE_SHIFT",
            LocalizedMessage::new(
                "当前设备没有进行中的班次，请先开班。",
                "No hay ningún turno abierto en este dispositivo. Abra un turno antes de vender.",
            ),
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message.es)
    }
}
