use crate::domain::{InvoiceNumber, PassPurchase, PassRecords, TopupOrder};

/// Transactional storage for pass sales
#[async_trait::async_trait]
pub trait DatabasePort {
    type Transaction: TransactionPort;

    /// Open a transaction
    ///
    /// Dropping the returned value without calling [`TransactionPort::commit`] rolls it back.
    async fn begin(&self) -> Result<Self::Transaction, Error>;

    /// Committed order for an idempotency key, outside of any transaction
    async fn find_order_by_idempotency_key(
        &self,
        store_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<TopupOrder>, Error>;
}

/// Operations that run inside one open transaction
#[async_trait::async_trait]
pub trait TransactionPort: Send {
    async fn find_order_by_idempotency_key(
        &mut self,
        store_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<TopupOrder>, Error>;

    /// Next number in the store's invoice series
    ///
    /// The counter stays locked until the transaction ends, so numbers are gapless and never
    /// handed out twice.
    async fn allocate_invoice_number(
        &mut self,
        store_id: i64,
        prefix: &str,
    ) -> Result<InvoiceNumber, Error>;

    /// Write the order and its pass together
    async fn create_pass_records(&mut self, purchase: &PassPurchase)
        -> Result<PassRecords, Error>;

    async fn commit(self) -> Result<(), Error>;
    async fn rollback(self) -> Result<(), Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An order with this idempotency key already exists in the store
    #[error("idempotency key {idempotency_key} already used in store {store_id}")]
    DuplicateIdempotencyKey {
        store_id: i64,
        idempotency_key: String,
    },

    /// Invoice numbers must never be reused
    #[error("invoice number {0} already issued")]
    InvoiceNumberTaken(InvoiceNumber),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
