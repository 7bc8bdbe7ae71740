#[mockall::automock]
#[async_trait::async_trait]
pub trait StorePort {
    /// Fails with [`Error::NoActiveShift`] unless a shift is open on this store and device
    async fn ensure_active_shift(&self, store_id: i64, device_id: i64) -> Result<(), Error>;
    async fn get_store_config(&self, store_id: i64) -> Result<Option<StoreConfig>, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub store_id: i64,
    pub store_name: String,
    /// Fiscal invoice series used for this store's sales
    pub invoice_prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no active shift for store {store_id} on device {device_id}")]
    NoActiveShift { store_id: i64, device_id: i64 },

    /// Concrete adapter errors
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
