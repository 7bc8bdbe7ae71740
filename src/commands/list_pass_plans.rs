use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::Service;

use crate::{domain::PassPlan, ports::plan::PlanPort};

use super::{DomainLogic, Error};

/// List the pass plans on sale
#[derive(Clone, Copy, Debug, Default)]
pub struct ListPassPlansRequest;

impl<D, M, P, S, R, I> Service<ListPassPlansRequest> for DomainLogic<D, M, P, S, R, I>
where
    P: PlanPort + Send + Sync + 'static,
{
    type Response = Vec<PassPlan>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ListPassPlansRequest) -> Self::Future {
        let plan = self.plan.clone();
        Box::pin(async move {
            let mut plans = plan.list_active_plans().await.map_err(|err| {
                tracing::error!(error = %err, "failed to list pass plans");
                Error::from(err)
            })?;
            // Adapters already filter and sort; keep the contract even if one does not
            plans.retain(|p| p.is_active);
            plans.sort_by(|a, b| a.sale_price.cmp(&b.sale_price));
            Ok(plans)
        })
    }
}
