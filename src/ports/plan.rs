use crate::domain::PassPlan;

#[mockall::automock]
#[async_trait::async_trait]
pub trait PlanPort {
    /// Active plans, cheapest first
    async fn list_active_plans(&self) -> Result<Vec<PassPlan>, Error>;
    /// Plan sold under `sku`, active or not
    async fn get_pass_plan_by_sku(&self, sku: &str) -> Result<Option<PassPlan>, Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Concrete adapter errors
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
