//! Pass purchase
//!
//! `VALIDATE_INPUT → CHECK_SHIFT → CHECK_MEMBER → CHECK_PLAN → VALIDATE_BUSINESS_RULES →
//! ALLOCATE_INVOICE → PERSIST → COMMIT | ABORT`
//!
//! Everything up to the business rules is read-only and runs outside of any transaction. The
//! transaction opens right before the idempotency check and the invoice allocation, and every
//! failure from there on rolls it back before the error is returned: an aborted purchase never
//! consumes an invoice number.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower::Service;

use crate::{
    config::IdempotencyPolicy,
    domain::{
        mask_phone, CartItem, InvoiceNumber, MemberRow, PassPlan, PassPurchase, PassRecords,
        PaymentMethod, PromoResult, RequestContext, TopupOrder, Violation,
    },
    ports::{
        database::{self, DatabasePort, TransactionPort},
        member::MemberPort,
        plan::PlanPort,
        rules::RulesPort,
        store::StorePort,
    },
};

use super::{DomainLogic, Error};

/// Message sent along with a successful purchase
pub const PASS_PURCHASE_SUCCESS: &str = "PASS_PURCHASE_SUCCESS";

/// Wire payload of a pass purchase
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PurchasePassPayload {
    #[serde(default)]
    pub cart: Vec<CartItem>,
    #[serde(default)]
    pub member_id: Option<i64>,
    #[serde(default, alias = "secondary_phone")]
    pub secondary_phone_input: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub promo_result: Option<PromoResult>,
}

impl PurchasePassPayload {
    /// Attach the session context of the caller
    pub fn into_request(self, context: RequestContext) -> PurchasePassRequest {
        PurchasePassRequest {
            context,
            idempotency_key: self.idempotency_key.unwrap_or_default(),
            cart: self.cart,
            member_id: self.member_id,
            secondary_phone: self.secondary_phone_input,
            payment_method: self.payment_method.unwrap_or_default(),
            promo: self.promo_result.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PurchasePassRequest {
    pub context: RequestContext,
    pub idempotency_key: String,
    pub cart: Vec<CartItem>,
    pub member_id: Option<i64>,
    /// Phone typed again by the customer, to confirm the logged-in member
    pub secondary_phone: Option<String>,
    pub payment_method: String,
    pub promo: PromoResult,
}

/// Follow-up the POS runs after a purchase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientAction {
    LogoutMember,
    ClearOrder,
    ResetToHome,
    ShowPassSuccessPage,
}

const PURCHASE_ACTIONS: [ClientAction; 4] = [
    ClientAction::LogoutMember,
    ClientAction::ClearOrder,
    ClientAction::ResetToHome,
    ClientAction::ShowPassSuccessPage,
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PurchasePassResponse {
    pub order_id: i64,
    pub pass_id: i64,
    pub member_id: i64,
    pub phone_masked: String,
    /// `series-number`
    pub invoice_number: String,
    pub actions: Vec<ClientAction>,
    /// The purchase had already been committed by an earlier request with the same key
    pub replayed: bool,
}

impl PurchasePassResponse {
    fn new(
        order_id: i64,
        pass_id: i64,
        member: &MemberRow,
        invoice: &InvoiceNumber,
        replayed: bool,
    ) -> Self {
        Self {
            order_id,
            pass_id,
            member_id: member.id,
            phone_masked: mask_phone(&member.phone_number),
            invoice_number: invoice.to_string(),
            actions: PURCHASE_ACTIONS.to_vec(),
            replayed,
        }
    }
}

impl<D, M, P, S, R, I> Service<PurchasePassRequest> for DomainLogic<D, M, P, S, R, I>
where
    D: DatabasePort + Send + Sync + 'static,
    M: MemberPort + Send + Sync + 'static,
    P: PlanPort + Send + Sync + 'static,
    S: StorePort + Send + Sync + 'static,
    R: RulesPort + Send + Sync + 'static,
{
    type Response = PurchasePassResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PurchasePassRequest) -> Self::Future {
        let workflow = Workflow {
            database: self.database.clone(),
            member: self.member.clone(),
            plan: self.plan.clone(),
            store: self.store.clone(),
            rules: self.rules.clone(),
            idempotency: self.idempotency,
        };
        Box::pin(async move { workflow.run(req).await })
    }
}

/// Request that passed input validation
struct ValidPurchase {
    context: RequestContext,
    idempotency_key: String,
    item: CartItem,
    cart: Vec<CartItem>,
    member_id: i64,
    secondary_phone: Option<String>,
    payment_method: PaymentMethod,
    promo: PromoResult,
}

fn validate_input(req: PurchasePassRequest) -> Result<ValidPurchase, Error> {
    let idempotency_key = req.idempotency_key.trim().to_string();
    if idempotency_key.is_empty() {
        return Err(Error::Validation("idempotency key is required".into()));
    }

    let [item] = req.cart.as_slice() else {
        return Err(Error::Validation(
            "cart must contain exactly one pass item".into(),
        ));
    };
    let item = CartItem {
        product_code: item.product_code.trim().to_string(),
        quantity: item.quantity,
    };
    if item.product_code.is_empty() {
        return Err(Error::Validation("cart item has no product code".into()));
    }

    let member_id = req
        .member_id
        .filter(|id| *id > 0)
        .ok_or_else(|| Error::Validation("member id is required".into()))?;

    let payment_method = PaymentMethod::parse(&req.payment_method)
        .ok_or_else(|| Error::BusinessRule(Violation::unsupported_payment_method()))?;

    let secondary_phone = req
        .secondary_phone
        .map(|phone| phone.trim().to_string())
        .filter(|phone| !phone.is_empty());

    Ok(ValidPurchase {
        context: req.context,
        idempotency_key,
        cart: vec![item.clone()],
        item,
        member_id,
        secondary_phone,
        payment_method,
        promo: req.promo,
    })
}

enum Persisted {
    Created {
        records: PassRecords,
        invoice: InvoiceNumber,
    },
    /// The idempotency key already belongs to a committed order
    Existing(TopupOrder),
}

struct Workflow<D, M, P, S, R> {
    database: Arc<D>,
    member: Arc<M>,
    plan: Arc<P>,
    store: Arc<S>,
    rules: Arc<R>,
    idempotency: IdempotencyPolicy,
}

impl<D, M, P, S, R> Workflow<D, M, P, S, R>
where
    D: DatabasePort,
    M: MemberPort,
    P: PlanPort,
    S: StorePort,
    R: RulesPort,
{
    async fn run(&self, req: PurchasePassRequest) -> Result<PurchasePassResponse, Error> {
        let input = validate_input(req).inspect_err(|err| log_abort(err, None))?;
        self.purchase(&input)
            .await
            .inspect_err(|err| log_abort(err, Some(input.member_id)))
    }

    async fn purchase(&self, input: &ValidPurchase) -> Result<PurchasePassResponse, Error> {
        let ctx = input.context;

        // A retry of a committed sale replays even if the shift, member or plan changed since
        if let Some(order) = self
            .database
            .find_order_by_idempotency_key(ctx.store_id, &input.idempotency_key)
            .await?
        {
            return self.resolve_existing(order, input).await;
        }

        let (member, plan) = self.check(input).await?;

        let mut tx = self.database.begin().await?;
        let outcome = match self.persist(&mut tx, input, &plan).await {
            Ok(persisted) => tx.commit().await.map(|()| persisted).map_err(Error::from),
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        };

        match outcome {
            Ok(Persisted::Created { records, invoice }) => {
                tracing::info!(
                    store_id = ctx.store_id,
                    device_id = ctx.device_id,
                    user_id = ctx.user_id,
                    member_id = member.id,
                    order_id = records.order_id,
                    pass_id = records.pass_id,
                    invoice = %invoice,
                    "pass purchase committed"
                );
                Ok(PurchasePassResponse::new(
                    records.order_id,
                    records.pass_id,
                    &member,
                    &invoice,
                    false,
                ))
            }
            Ok(Persisted::Existing(order)) => self.resolve_existing(order, input).await,
            Err(Error::Database(database::Error::DuplicateIdempotencyKey { .. })) => {
                // A concurrent request with the same key committed first
                let order = self
                    .database
                    .find_order_by_idempotency_key(ctx.store_id, &input.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal("idempotency key conflict without a committed order".into())
                    })?;
                self.resolve_existing(order, input).await
            }
            Err(err) => Err(err),
        }
    }

    /// Read-only preconditions, before any transaction opens
    async fn check(&self, input: &ValidPurchase) -> Result<(MemberRow, PassPlan), Error> {
        let ctx = input.context;

        self.store
            .ensure_active_shift(ctx.store_id, ctx.device_id)
            .await?;

        let member = self
            .member
            .get_member_by_id(input.member_id)
            .await?
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                Error::NotFound(format!("member {} not found", input.member_id).into())
            })?;
        if let Some(secondary_phone) = &input.secondary_phone {
            if secondary_phone != member.phone_number.trim() {
                return Err(Error::BusinessRule(Violation::phone_mismatch()));
            }
        }

        let plan = self
            .plan
            .get_pass_plan_by_sku(&input.item.product_code)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                Error::NotFound(
                    format!("pass plan not found for sku: {}", input.item.product_code).into(),
                )
            })?;

        let tags = self.rules.get_cart_item_tags(&input.cart).await?;
        self.rules
            .validate_purchase_order(&input.cart, &tags, &input.promo, &plan)?;

        Ok((member, plan))
    }

    /// Every mutating step, inside the open transaction
    async fn persist(
        &self,
        tx: &mut D::Transaction,
        input: &ValidPurchase,
        plan: &PassPlan,
    ) -> Result<Persisted, Error> {
        let ctx = input.context;

        if let Some(order) = tx
            .find_order_by_idempotency_key(ctx.store_id, &input.idempotency_key)
            .await?
        {
            return Ok(Persisted::Existing(order));
        }

        let prefix = self
            .store
            .get_store_config(ctx.store_id)
            .await?
            .and_then(|config| config.invoice_prefix)
            .map(|prefix| prefix.trim().to_string())
            .filter(|prefix| !prefix.is_empty())
            .ok_or_else(|| {
                Error::Internal(
                    format!("store {} has no invoice prefix configured", ctx.store_id).into(),
                )
            })?;
        let invoice = tx.allocate_invoice_number(ctx.store_id, &prefix).await?;

        let purchase = PassPurchase::new(
            ctx,
            input.member_id,
            input.payment_method,
            input.idempotency_key.clone(),
            invoice.clone(),
            &input.item,
            plan,
            Utc::now(),
        );
        let records = tx.create_pass_records(&purchase).await?;

        Ok(Persisted::Created { records, invoice })
    }

    async fn resolve_existing(
        &self,
        order: TopupOrder,
        input: &ValidPurchase,
    ) -> Result<PurchasePassResponse, Error> {
        let same_purchase = order.member_id == input.member_id
            && order.sale_sku == input.item.product_code
            && order.payment_method == input.payment_method;

        match self.idempotency {
            IdempotencyPolicy::Reject => {
                return Err(Error::Conflict(
                    format!("idempotency key already used by order {}", order.order_id).into(),
                ))
            }
            IdempotencyPolicy::Replay if !same_purchase => {
                return Err(Error::Conflict(
                    format!(
                        "idempotency key already used by order {} for a different purchase",
                        order.order_id
                    )
                    .into(),
                ))
            }
            IdempotencyPolicy::Replay => {}
        }

        // Deactivated members still get their committed sale back
        let member = self
            .member
            .get_member_by_id(order.member_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(
                    format!("member {} of order {} is missing", order.member_id, order.order_id)
                        .into(),
                )
            })?;

        tracing::info!(
            order_id = order.order_id,
            idempotency_key = %input.idempotency_key,
            "replaying committed pass purchase"
        );
        Ok(PurchasePassResponse::new(
            order.order_id,
            order.pass_id,
            &member,
            &order.invoice,
            true,
        ))
    }
}

fn log_abort(err: &Error, member_id: Option<i64>) {
    if err.status() >= 500 {
        tracing::error!(error = %err, member_id, "pass purchase aborted");
    } else {
        tracing::warn!(error = %err, member_id, "pass purchase rejected");
    }
}

async fn rollback<T: TransactionPort>(tx: T) {
    if let Err(err) = tx.rollback().await {
        tracing::error!(error = %err, "failed to roll back pass purchase");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::database::memory::{ErasedPoisonError, MemoryDatabase, MemoryTransaction},
        commands::{testing::*, ErrorKind},
        ports::{
            rules::{self, MockRulesPort},
            store::StoreConfig,
        },
        response::ApiResponse,
    };
    use chrono::Duration;
    use rstest::*;
    use rust_decimal::Decimal;
    use speculoos::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{BoxError, ServiceExt};

    /// Memory database that counts opened transactions
    #[derive(Debug, Default)]
    struct CountingDatabase {
        inner: MemoryDatabase,
        begins: AtomicUsize,
        fail_begin: bool,
    }

    impl CountingDatabase {
        fn begins(&self) -> usize {
            self.begins.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl DatabasePort for CountingDatabase {
        type Transaction = MemoryTransaction;

        async fn begin(&self) -> Result<MemoryTransaction, database::Error> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            if self.fail_begin {
                return Err(database::Error::Adapter("connection refused".into()));
            }
            self.inner.begin().await
        }

        async fn find_order_by_idempotency_key(
            &self,
            store_id: i64,
            idempotency_key: &str,
        ) -> Result<Option<TopupOrder>, database::Error> {
            self.inner
                .find_order_by_idempotency_key(store_id, idempotency_key)
                .await
        }
    }

    fn counting_logic(
        database: &MemoryDatabase,
    ) -> DomainLogic<
        CountingDatabase,
        MemoryDatabase,
        MemoryDatabase,
        MemoryDatabase,
        crate::adapters::rules::limits::PurchaseLimits,
        crate::adapters::ids::UuidV4Generator,
    > {
        memory_logic(database).with_database(CountingDatabase {
            inner: database.clone(),
            begins: AtomicUsize::new(0),
            fail_begin: false,
        })
    }

    fn request(key: &str) -> PurchasePassRequest {
        PurchasePassRequest {
            context: context(),
            idempotency_key: key.to_string(),
            cart: vec![CartItem {
                product_code: PASS_SKU.to_string(),
                quantity: 1,
            }],
            member_id: Some(MEMBER_ID),
            secondary_phone: Some(MEMBER_PHONE.to_string()),
            payment_method: "cash".to_string(),
            promo: PromoResult::default(),
        }
    }

    fn violation_code(err: &Error) -> Option<&str> {
        match err {
            Error::BusinessRule(violation) => Some(violation.code.as_ref()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_purchase() -> Result<(), BoxError> {
        // GIVEN a store with an open shift, a member and a plan
        let database = seeded_database();

        // WHEN purchasing a pass
        let res = memory_logic(&database).oneshot(request("key-1")).await?;

        // THEN one order and one pass are created, and the response carries the invoice
        assert_that!(res.invoice_number).is_equal_to("VR24-1".to_string());
        assert_that!(res.phone_masked).is_equal_to("*****5678".to_string());
        assert_that!(res.member_id).is_equal_to(MEMBER_ID);
        assert_that!(res.replayed).is_false();
        assert_that!(res.actions).is_equal_to(PURCHASE_ACTIONS.to_vec());

        let orders = database.orders()?;
        assert_that!(orders).has_length(1);
        let order = &orders[0];
        assert_that!(order.order_id).is_equal_to(res.order_id);
        assert_that!(order.context).is_equal_to(context());
        assert_that!(order.payment_method).is_equal_to(PaymentMethod::Cash);
        assert_that!(order.idempotency_key).is_equal_to("key-1".to_string());
        assert_that!(order.amount).is_equal_to(Decimal::new(4500, 2));

        let passes = database.passes_of(MEMBER_ID)?;
        assert_that!(passes).has_length(1);
        let pass = &passes[0];
        assert_that!(pass.member_pass_id).is_equal_to(res.pass_id);
        assert_that!(pass.topup_order_id).is_equal_to(res.order_id);
        assert_that!(pass.remaining_uses).is_equal_to(10);
        assert_that!(pass.expires_at).is_equal_to(today() + Duration::days(90));

        Ok(())
    }

    #[tokio::test]
    async fn test_response_json() -> Result<(), BoxError> {
        let database = seeded_database();

        let res = memory_logic(&database).oneshot(request("key-1")).await?;
        let json = serde_json::to_value(ApiResponse::ok(res, PASS_PURCHASE_SUCCESS))?;

        assert_that!(json["status"].as_str()).is_equal_to(Some("success"));
        assert_that!(json["message"].as_str()).is_equal_to(Some("PASS_PURCHASE_SUCCESS"));
        let json = &json["data"];
        assert_that!(json["invoice_number"].as_str()).is_equal_to(Some("VR24-1"));
        assert_that!(json["phone_masked"].as_str()).is_equal_to(Some("*****5678"));
        assert_that!(json["actions"]).is_equal_to(serde_json::json!([
            "LOGOUT_MEMBER",
            "CLEAR_ORDER",
            "RESET_TO_HOME",
            "SHOW_PASS_SUCCESS_PAGE"
        ]));
        Ok(())
    }

    #[tokio::test]
    async fn test_invoice_numbers_increase() -> Result<(), BoxError> {
        let database = seeded_database();
        let domain = memory_logic(&database);

        let first = domain.clone().oneshot(request("key-1")).await?;
        let second = domain.clone().oneshot(request("key-2")).await?;

        assert_that!(first.invoice_number).is_equal_to("VR24-1".to_string());
        assert_that!(second.invoice_number).is_equal_to("VR24-2".to_string());
        assert_that!(first.order_id).is_not_equal_to(second.order_id);
        assert_that!(database.orders()?).has_length(2);
        Ok(())
    }

    #[rstest]
    #[case("bitcoin")]
    #[case("")]
    #[case("CARD")]
    #[tokio::test]
    async fn test_unsupported_payment_method(#[case] payment_method: &str) -> Result<(), BoxError> {
        // GIVEN a purchase paid with something other than cash or card
        let database = seeded_database();
        let domain = counting_logic(&database);
        let mut req = request("key-1");
        req.payment_method = payment_method.to_string();

        // WHEN purchasing
        let res = domain.clone().oneshot(req).await;

        // THEN it is rejected with a bilingual message before any transaction opens
        assert_that!(res).is_err().matches(|err| {
            violation_code(err) == Some("UNSUPPORTED_PAYMENT_METHOD")
                && err.kind() == ErrorKind::BusinessRule
                && err.localized().is_some_and(|m| !m.zh.is_empty() && !m.es.is_empty())
        });
        assert_that!(domain.database.begins()).is_equal_to(0);
        assert_that!(database.orders()?).has_length(0);
        Ok(())
    }

    #[tokio::test]
    async fn test_secondary_phone_mismatch() -> Result<(), BoxError> {
        // GIVEN a confirmation phone that belongs to someone else
        let database = seeded_database();
        let domain = counting_logic(&database);
        let mut req = request("key-1");
        req.secondary_phone = Some("600000000".to_string());

        // WHEN purchasing
        let res = domain.clone().oneshot(req).await;

        // THEN the purchase is rejected without consuming an invoice number
        assert_that!(res)
            .is_err()
            .matches(|err| violation_code(err) == Some("PHONE_MISMATCH"));
        assert_that!(domain.database.begins()).is_equal_to(0);

        let next = domain.clone().oneshot(request("key-2")).await?;
        assert_that!(next.invoice_number).is_equal_to("VR24-1".to_string());
        Ok(())
    }

    #[rstest]
    #[case(None)]
    #[case(Some(""))]
    #[case(Some(" 612345678 "))]
    #[tokio::test]
    async fn test_secondary_phone_optional_and_trimmed(
        #[case] secondary_phone: Option<&str>,
    ) -> Result<(), BoxError> {
        let database = seeded_database();
        let mut req = request("key-1");
        req.secondary_phone = secondary_phone.map(str::to_string);

        let res = memory_logic(&database).oneshot(req).await;

        assert_that!(res).is_ok();
        Ok(())
    }

    #[rstest]
    #[case::missing_key(|req: &mut PurchasePassRequest| req.idempotency_key = "  ".to_string())]
    #[case::empty_cart(|req: &mut PurchasePassRequest| req.cart.clear())]
    #[case::two_items(|req: &mut PurchasePassRequest| {
        let item = req.cart[0].clone();
        req.cart.push(item);
    })]
    #[case::no_product_code(|req: &mut PurchasePassRequest| req.cart[0].product_code = " ".to_string())]
    #[case::missing_member(|req: &mut PurchasePassRequest| req.member_id = None)]
    #[case::zero_member(|req: &mut PurchasePassRequest| req.member_id = Some(0))]
    #[tokio::test]
    async fn test_invalid_input(
        #[case] edit: fn(&mut PurchasePassRequest),
    ) -> Result<(), BoxError> {
        let database = seeded_database();
        let domain = counting_logic(&database);
        let mut req = request("key-1");
        edit(&mut req);

        let res = domain.clone().oneshot(req).await;

        assert_that!(res)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::Validation && err.status() == 400);
        assert_that!(domain.database.begins()).is_equal_to(0);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_active_shift() -> Result<(), BoxError> {
        let database = seeded_database();
        let mut req = request("key-1");
        req.context.device_id = 11;

        let res = memory_logic(&database).oneshot(req).await;

        assert_that!(res)
            .is_err()
            .matches(|err| violation_code(err) == Some("NO_ACTIVE_SHIFT"));
        assert_that!(database.orders()?).has_length(0);
        Ok(())
    }

    #[rstest]
    #[case::unknown(Some(42), false)]
    #[case::inactive(Some(2), true)]
    #[tokio::test]
    async fn test_member_not_found(
        #[case] member_id: Option<i64>,
        #[case] seed_inactive: bool,
    ) -> Result<(), BoxError> {
        let database = seeded_database();
        if seed_inactive {
            database.insert_member_row(member_row(2, "699999999", false))?;
        }
        let mut req = request("key-1");
        req.member_id = member_id;
        req.secondary_phone = None;

        let res = memory_logic(&database).oneshot(req).await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::NotFound(_)) && err.status() == 404);
        Ok(())
    }

    #[rstest]
    #[case::unknown_sku("PASS-UNKNOWN")]
    #[case::inactive_plan("PASS-OLD")]
    #[tokio::test]
    async fn test_plan_not_found(#[case] sku: &str) -> Result<(), BoxError> {
        let database = seeded_database();
        database.insert_plan(plan(2, "PASS-OLD", Decimal::new(1000, 2), false))?;
        let domain = counting_logic(&database);
        let mut req = request("key-1");
        req.cart[0].product_code = sku.to_string();

        let res = domain.clone().oneshot(req).await;

        assert_that!(res)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::NotFound);
        assert_that!(domain.database.begins()).is_equal_to(0);
        Ok(())
    }

    #[tokio::test]
    async fn test_business_rule_violation() -> Result<(), BoxError> {
        // GIVEN a cart asking for two passes at once
        let database = seeded_database();
        let domain = counting_logic(&database);
        let mut req = request("key-1");
        req.cart[0].quantity = 2;

        // WHEN purchasing
        let res = domain.clone().oneshot(req).await;

        // THEN the purchase limit rejects it before anything is written
        assert_that!(res)
            .is_err()
            .matches(|err| violation_code(err) == Some("PASS_QUANTITY_LIMIT"));
        assert_that!(domain.database.begins()).is_equal_to(0);
        Ok(())
    }

    #[tokio::test]
    async fn test_rules_receive_cart_tags() -> Result<(), BoxError> {
        // GIVEN a rules engine that tags the pass as not for sale
        let mut engine = MockRulesPort::new();
        engine
            .expect_get_cart_item_tags()
            .times(1)
            .returning(|cart| {
                Ok(cart
                    .iter()
                    .map(|item| (item.product_code.clone(), vec!["seasonal".to_string()]))
                    .collect())
            });
        engine
            .expect_validate_purchase_order()
            .times(1)
            .withf(|cart, tags, _, plan| {
                cart.len() == 1 && tags.contains_key(PASS_SKU) && plan.sale_sku == PASS_SKU
            })
            .returning(|_, _, _, _| {
                Err(rules::Error::Violation(Violation::new(
                    "PASS_NOT_FOR_SALE",
                    crate::domain::LocalizedMessage::new(
                        "该优惠卡暂停销售。",
                        "Este bono no está a la venta.",
                    ),
                )))
            });
        let database = seeded_database();
        let domain = memory_logic(&database).with_rules(engine);

        // WHEN purchasing
        let res = domain.clone().oneshot(request("key-1")).await;

        // THEN the violation is returned as is
        assert_that!(res)
            .is_err()
            .matches(|err| violation_code(err) == Some("PASS_NOT_FOR_SALE"));
        assert_that!(database.orders()?).has_length(0);
        Arc::into_inner(domain.rules).unwrap().checkpoint();
        Ok(())
    }

    #[tokio::test]
    async fn test_rules_unavailable() -> Result<(), BoxError> {
        let mut engine = MockRulesPort::new();
        engine
            .expect_get_cart_item_tags()
            .times(1)
            .returning(|_| Err(rules::Error::Adapter("tag service down".into())));
        engine.expect_validate_purchase_order().never();
        let database = seeded_database();
        let domain = memory_logic(&database).with_rules(engine);

        let res = domain.clone().oneshot(request("key-1")).await;

        assert_that!(res)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::Internal);
        Arc::into_inner(domain.rules).unwrap().checkpoint();
        Ok(())
    }

    #[rstest]
    #[case(None)]
    #[case(Some("  "))]
    #[tokio::test]
    async fn test_missing_invoice_prefix(#[case] prefix: Option<&str>) -> Result<(), BoxError> {
        // GIVEN a store without a fiscal series
        let database = seeded_database();
        database.set_store_config(StoreConfig {
            store_id: STORE_ID,
            store_name: "Centro".to_string(),
            invoice_prefix: prefix.map(str::to_string),
        })?;
        let domain = counting_logic(&database);

        // WHEN purchasing
        let res = domain.clone().oneshot(request("key-1")).await;

        // THEN it is an internal error and the transaction was rolled back
        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::Internal(_)) && err.status() == 500);
        assert_that!(domain.database.begins()).is_equal_to(1);
        assert_that!(database.orders()?).has_length(0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_after_allocation_rolls_back() -> Result<(), BoxError> {
        // GIVEN a record writer that fails after the invoice number was allocated
        let database = seeded_database();
        database.fail_record_writes(true);
        let domain = memory_logic(&database);

        // WHEN purchasing
        let res = domain.clone().oneshot(request("key-1")).await;

        // THEN nothing is written
        assert_that!(res)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::Internal);
        assert_that!(database.orders()?).has_length(0);
        assert_that!(database.passes_of(MEMBER_ID)?).has_length(0);

        // AND the invoice number was not consumed
        database.fail_record_writes(false);
        let next = domain.clone().oneshot(request("key-1")).await?;
        assert_that!(next.invoice_number).is_equal_to("VR24-1".to_string());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_key_replays() -> Result<(), BoxError> {
        // GIVEN a committed purchase
        let database = seeded_database();
        let domain = memory_logic(&database);
        let first = domain.clone().oneshot(request("key-1")).await?;

        // WHEN the same request is retried
        let retry = domain.clone().oneshot(request("key-1")).await?;

        // THEN the original result comes back and nothing new is written
        assert_that!(retry.replayed).is_true();
        assert_that!(retry.order_id).is_equal_to(first.order_id);
        assert_that!(retry.pass_id).is_equal_to(first.pass_id);
        assert_that!(retry.invoice_number).is_equal_to(first.invoice_number);
        assert_that!(database.orders()?).has_length(1);
        assert_that!(database.passes_of(MEMBER_ID)?).has_length(1);

        // AND no invoice number was consumed by the retry
        let next = domain.clone().oneshot(request("key-2")).await?;
        assert_that!(next.invoice_number).is_equal_to("VR24-2".to_string());
        Ok(())
    }

    #[rstest]
    #[case::shift_closed(|db: &MemoryDatabase| db.close_shift(STORE_ID, DEVICE_ID))]
    #[case::plan_deactivated(|db: &MemoryDatabase| db.set_plan_active(1, false))]
    #[case::member_deactivated(|db: &MemoryDatabase| db.set_member_active(MEMBER_ID, false))]
    #[tokio::test]
    async fn test_replay_after_preconditions_change(
        #[case] change: fn(&MemoryDatabase) -> Result<(), ErasedPoisonError>,
    ) -> Result<(), BoxError> {
        // GIVEN a committed purchase
        let database = seeded_database();
        let domain = counting_logic(&database);
        let first = domain.clone().oneshot(request("key-1")).await?;

        // AND a precondition that no longer holds
        change(&database)?;

        // WHEN the POS retries the same request
        let retry = domain.clone().oneshot(request("key-1")).await?;

        // THEN the committed sale is returned without opening a transaction
        assert_that!(retry.replayed).is_true();
        assert_that!(retry.order_id).is_equal_to(first.order_id);
        assert_that!(retry.invoice_number).is_equal_to(first.invoice_number);
        assert_that!(retry.phone_masked).is_equal_to("*****5678".to_string());
        assert_that!(domain.database.begins()).is_equal_to(1);
        assert_that!(database.orders()?).has_length(1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_after_shift_closed_rejected_by_policy() -> Result<(), BoxError> {
        let database = seeded_database();
        let domain = memory_logic(&database).with_idempotency_policy(IdempotencyPolicy::Reject);
        domain.clone().oneshot(request("key-1")).await?;
        database.close_shift(STORE_ID, DEVICE_ID)?;

        let retry = domain.clone().oneshot(request("key-1")).await;

        assert_that!(retry)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::Conflict);
        Ok(())
    }

    #[tokio::test]
    async fn test_transaction_unavailable() -> Result<(), BoxError> {
        // GIVEN a database that cannot open transactions
        let database = seeded_database();
        let domain = memory_logic(&database).with_database(CountingDatabase {
            inner: database.clone(),
            begins: AtomicUsize::new(0),
            fail_begin: true,
        });

        // WHEN purchasing
        let res = domain.clone().oneshot(request("key-1")).await;

        // THEN the storage fault surfaces as an internal error
        assert_that!(res)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::Internal && err.status() == 500);
        assert_that!(domain.database.begins()).is_equal_to(1);
        assert_that!(database.orders()?).has_length(0);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() -> Result<(), BoxError> {
        let database = seeded_database();
        let domain = memory_logic(&database).with_idempotency_policy(IdempotencyPolicy::Reject);
        domain.clone().oneshot(request("key-1")).await?;

        let retry = domain.clone().oneshot(request("key-1")).await;

        assert_that!(retry)
            .is_err()
            .matches(|err| matches!(err, Error::Conflict(_)) && err.status() == 409);
        assert_that!(database.orders()?).has_length(1);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_key_different_purchase() -> Result<(), BoxError> {
        // GIVEN a key already used by another member
        let database = seeded_database();
        database.insert_member_row(member_row(2, "699000333", true))?;
        let domain = memory_logic(&database);
        domain.clone().oneshot(request("key-1")).await?;

        // WHEN a purchase for a different member reuses it
        let mut req = request("key-1");
        req.member_id = Some(2);
        req.secondary_phone = Some("699000333".to_string());
        let res = domain.clone().oneshot(req).await;

        // THEN it is a conflict, not a replay
        assert_that!(res)
            .is_err()
            .matches(|err| err.kind() == ErrorKind::Conflict);
        assert_that!(database.orders()?).has_length(1);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_key_in_other_store() -> Result<(), BoxError> {
        let database = seeded_database();
        database.set_store_config(StoreConfig {
            store_id: 2,
            store_name: "Norte".to_string(),
            invoice_prefix: Some("VRN".to_string()),
        })?;
        database.open_shift(2, DEVICE_ID)?;
        let domain = memory_logic(&database);
        domain.clone().oneshot(request("key-1")).await?;

        let mut req = request("key-1");
        req.context.store_id = 2;
        let res = domain.clone().oneshot(req).await?;

        assert_that!(res.replayed).is_false();
        assert_that!(res.invoice_number).is_equal_to("VRN-1".to_string());
        assert_that!(database.orders()?).has_length(2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_purchases() -> Result<(), BoxError> {
        // GIVEN many devices selling at the same time
        let database = seeded_database();
        let domain = memory_logic(&database);

        // WHEN they all purchase with distinct keys
        let handles: Vec<_> = (0..25)
            .map(|i| tokio::spawn(domain.clone().oneshot(request(&format!("key-{i}")))))
            .collect();
        let mut numbers = Vec::new();
        for handle in handles {
            let res = handle.await??;
            numbers.push(res.invoice_number);
        }

        // THEN every purchase got its own gapless invoice number
        let mut numbers: Vec<u64> = numbers
            .iter()
            .map(|n| n.trim_start_matches("VR24-").parse::<u64>())
            .collect::<Result<_, _>>()?;
        numbers.sort_unstable();
        assert_that!(numbers).is_equal_to((1..=25).collect::<Vec<u64>>());
        assert_that!(database.orders()?).has_length(25);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_submissions() -> Result<(), BoxError> {
        // GIVEN the same request submitted many times at once
        let database = seeded_database();
        let domain = memory_logic(&database);

        let handles: Vec<_> = (0..10)
            .map(|_| tokio::spawn(domain.clone().oneshot(request("key-1"))))
            .collect();
        let mut order_ids = Vec::new();
        for handle in handles {
            order_ids.push(handle.await??.order_id);
        }

        // THEN exactly one order exists and every submission reports it
        order_ids.dedup();
        assert_that!(order_ids).has_length(1);
        assert_that!(database.orders()?).has_length(1);

        let next = domain.clone().oneshot(request("key-2")).await?;
        assert_that!(next.invoice_number).is_equal_to("VR24-2".to_string());
        Ok(())
    }

    #[test]
    fn test_payload_into_request() {
        let payload: PurchasePassPayload = serde_json::from_str(
            r#"{
                "cart": [{"product_code": "PASS-10"}],
                "member_id": 1,
                "secondary_phone": "612345678",
                "payment_method": "card",
                "idempotency_key": "abc",
                "promo_result": null
            }"#,
        )
        .unwrap();

        let req = payload.into_request(context());

        assert_that!(req).is_equal_to(PurchasePassRequest {
            context: context(),
            idempotency_key: "abc".to_string(),
            cart: vec![CartItem {
                product_code: "PASS-10".to_string(),
                quantity: 1,
            }],
            member_id: Some(1),
            secondary_phone: Some("612345678".to_string()),
            payment_method: "card".to_string(),
            promo: PromoResult::default(),
        });
    }
}
