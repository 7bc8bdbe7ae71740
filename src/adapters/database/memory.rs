use crate::{
    domain::{
        format_timestamp, InvoiceNumber, MemberPass, MemberRow, NewMember, PassPlan,
        PassPurchase, PassRecords, PassStatus, TopupOrder,
    },
    ports::{
        database::{self, DatabasePort, TransactionPort},
        member::{self, MemberPort},
        plan::{self, PlanPort},
        store::{self, StoreConfig, StorePort},
    },
};
use chrono::NaiveDate;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::OwnedMutexGuard;

/// In-memory implementation of every storage port
///
/// Writes made inside a [`MemoryTransaction`] are staged and only become visible on commit.
/// Invoice allocation takes a per-store lock that the transaction holds until it ends, which
/// also serializes the idempotency checks of that store.
#[derive(Clone, Debug)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
    store_locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

#[derive(Debug, Default)]
struct State {
    members: Vec<MemberRow>,
    /// level id -> (zh, es)
    member_levels: HashMap<i64, (String, String)>,
    plans: Vec<PassPlan>,
    passes: Vec<MemberPass>,
    orders: Vec<TopupOrder>,
    store_configs: HashMap<i64, StoreConfig>,
    /// (store, device)
    shifts: HashSet<(i64, i64)>,
    /// (store, series) -> last issued number
    invoice_counters: HashMap<(i64, String), u64>,
    last_id: i64,
    #[cfg(test)]
    fail_record_writes: bool,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn with_level_names(&self, mut row: MemberRow) -> MemberRow {
        if let Some((zh, es)) = row
            .member_level_id
            .and_then(|id| self.member_levels.get(&id))
        {
            row.level_name_zh = Some(zh.clone());
            row.level_name_es = Some(es.clone());
        }
        row
    }

    fn find_order(&self, store_id: i64, idempotency_key: &str) -> Option<&TopupOrder> {
        self.orders
            .iter()
            .find(|o| o.context.store_id == store_id && o.idempotency_key == idempotency_key)
    }

    fn invoice_issued(&self, store_id: i64, invoice: &InvoiceNumber) -> bool {
        self.orders
            .iter()
            .any(|o| o.context.store_id == store_id && &o.invoice == invoice)
    }
}

impl MemoryDatabase {
    fn lock(&self) -> Result<MutexGuard<'_, State>, ErasedPoisonError> {
        Ok(self.state.lock()?)
    }

    fn store_lock(&self, store_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>, ErasedPoisonError> {
        Ok(self.store_locks.lock()?.entry(store_id).or_default().clone())
    }

    /// Store a raw member row as-is, legacy values included
    pub fn insert_member_row(&self, row: MemberRow) -> Result<(), ErasedPoisonError> {
        let mut state = self.lock()?;
        state.last_id = state.last_id.max(row.id);
        state.members.push(row);
        Ok(())
    }

    pub fn add_member_level(
        &self,
        level_id: i64,
        name_zh: impl Into<String>,
        name_es: impl Into<String>,
    ) -> Result<(), ErasedPoisonError> {
        self.lock()?
            .member_levels
            .insert(level_id, (name_zh.into(), name_es.into()));
        Ok(())
    }

    pub fn insert_plan(&self, plan: PassPlan) -> Result<(), ErasedPoisonError> {
        self.lock()?.plans.push(plan);
        Ok(())
    }

    pub fn insert_pass(&self, pass: MemberPass) -> Result<(), ErasedPoisonError> {
        self.lock()?.passes.push(pass);
        Ok(())
    }

    pub fn set_store_config(&self, config: StoreConfig) -> Result<(), ErasedPoisonError> {
        self.lock()?.store_configs.insert(config.store_id, config);
        Ok(())
    }

    pub fn open_shift(&self, store_id: i64, device_id: i64) -> Result<(), ErasedPoisonError> {
        self.lock()?.shifts.insert((store_id, device_id));
        Ok(())
    }

    pub fn close_shift(&self, store_id: i64, device_id: i64) -> Result<(), ErasedPoisonError> {
        self.lock()?.shifts.remove(&(store_id, device_id));
        Ok(())
    }

    pub fn set_plan_active(&self, plan_id: i64, active: bool) -> Result<(), ErasedPoisonError> {
        let mut state = self.lock()?;
        if let Some(plan) = state.plans.iter_mut().find(|p| p.pass_plan_id == plan_id) {
            plan.is_active = active;
        }
        Ok(())
    }

    pub fn set_member_active(&self, member_id: i64, active: bool) -> Result<(), ErasedPoisonError> {
        let mut state = self.lock()?;
        if let Some(member) = state.members.iter_mut().find(|m| m.id == member_id) {
            member.is_active = active;
        }
        Ok(())
    }

    /// Committed orders, oldest first
    pub fn orders(&self) -> Result<Vec<TopupOrder>, ErasedPoisonError> {
        Ok(self.lock()?.orders.clone())
    }

    /// Committed passes of a member, whatever their state
    pub fn passes_of(&self, member_id: i64) -> Result<Vec<MemberPass>, ErasedPoisonError> {
        Ok(self
            .lock()?
            .passes
            .iter()
            .filter(|p| p.member_id == member_id)
            .cloned()
            .collect())
    }

    /// Make every `create_pass_records` call fail, to exercise rollbacks
    #[cfg(test)]
    pub(crate) fn fail_record_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_record_writes = fail;
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            store_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait::async_trait]
impl MemberPort for MemoryDatabase {
    async fn find_active_by_phone(&self, phone: &str) -> Result<Option<MemberRow>, member::Error> {
        let state = self.lock()?;
        let row = state
            .members
            .iter()
            .find(|m| m.is_active && m.phone_number.trim() == phone)
            .cloned()
            .map(|row| state.with_level_names(row));
        Ok(row)
    }

    async fn get_member_by_id(&self, member_id: i64) -> Result<Option<MemberRow>, member::Error> {
        let state = self.lock()?;
        let row = state
            .members
            .iter()
            .find(|m| m.id == member_id)
            .cloned()
            .map(|row| state.with_level_names(row));
        Ok(row)
    }

    async fn insert_member(&self, new: NewMember) -> Result<i64, member::Error> {
        let mut state = self.lock()?;
        // Mirrors a unique index on the phone of active members
        let phone = new.phone_number.trim();
        if state
            .members
            .iter()
            .any(|m| m.is_active && m.phone_number.trim() == phone)
        {
            return Err(member::Error::DuplicatePhone(new.phone_number));
        }

        let id = state.next_id();
        let timestamp = format_timestamp(new.created_at);
        state.members.push(MemberRow {
            id,
            member_uuid: new.member_uuid,
            first_name: new.first_name,
            last_name: new.last_name,
            phone_number: new.phone_number,
            email: new.email,
            birthdate: new.birthdate.map(|d| d.to_string()),
            member_level_id: Some(new.member_level_id),
            level_name_zh: None,
            level_name_es: None,
            points_balance: new.points_balance,
            is_active: true,
            created_at: Some(timestamp.clone()),
            updated_at: Some(timestamp),
        });
        Ok(id)
    }

    async fn get_member_active_passes(
        &self,
        member_id: i64,
        today: NaiveDate,
    ) -> Result<Vec<MemberPass>, member::Error> {
        let state = self.lock()?;
        let mut passes: Vec<_> = state
            .passes
            .iter()
            .filter(|p| p.member_id == member_id && p.is_valid_on(today))
            .cloned()
            .collect();
        passes.sort_by_key(|p| p.expires_at);
        Ok(passes)
    }
}

#[async_trait::async_trait]
impl PlanPort for MemoryDatabase {
    async fn list_active_plans(&self) -> Result<Vec<PassPlan>, plan::Error> {
        let mut plans: Vec<_> = self
            .lock()?
            .plans
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.sale_price.cmp(&b.sale_price));
        Ok(plans)
    }

    async fn get_pass_plan_by_sku(&self, sku: &str) -> Result<Option<PassPlan>, plan::Error> {
        Ok(self
            .lock()?
            .plans
            .iter()
            .find(|p| p.sale_sku == sku)
            .cloned())
    }
}

#[async_trait::async_trait]
impl StorePort for MemoryDatabase {
    async fn ensure_active_shift(&self, store_id: i64, device_id: i64) -> Result<(), store::Error> {
        if self.lock()?.shifts.contains(&(store_id, device_id)) {
            Ok(())
        } else {
            Err(store::Error::NoActiveShift {
                store_id,
                device_id,
            })
        }
    }

    async fn get_store_config(&self, store_id: i64) -> Result<Option<StoreConfig>, store::Error> {
        Ok(self.lock()?.store_configs.get(&store_id).cloned())
    }
}

#[async_trait::async_trait]
impl DatabasePort for MemoryDatabase {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, database::Error> {
        Ok(MemoryTransaction {
            database: self.clone(),
            store_lock: None,
            counters: Vec::new(),
            orders: Vec::new(),
            passes: Vec::new(),
        })
    }

    async fn find_order_by_idempotency_key(
        &self,
        store_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<TopupOrder>, database::Error> {
        Ok(self.lock()?.find_order(store_id, idempotency_key).cloned())
    }
}

/// Staged writes of one open transaction
#[derive(Debug)]
pub struct MemoryTransaction {
    database: MemoryDatabase,
    store_lock: Option<(i64, OwnedMutexGuard<()>)>,
    counters: Vec<((i64, String), u64)>,
    orders: Vec<TopupOrder>,
    passes: Vec<MemberPass>,
}

impl MemoryTransaction {
    async fn lock_store(&mut self, store_id: i64) -> Result<(), database::Error> {
        match &self.store_lock {
            Some((locked, _)) if *locked == store_id => Ok(()),
            Some((locked, _)) => Err(database::Error::Adapter(
                format!("transaction already holds the lock of store {locked}").into(),
            )),
            None => {
                let lock = self.database.store_lock(store_id)?;
                self.store_lock = Some((store_id, lock.lock_owned().await));
                Ok(())
            }
        }
    }

    fn staged_counter(&self, key: &(i64, String)) -> Option<u64> {
        self.counters
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, n)| *n)
    }
}

#[async_trait::async_trait]
impl TransactionPort for MemoryTransaction {
    async fn find_order_by_idempotency_key(
        &mut self,
        store_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<TopupOrder>, database::Error> {
        if let Some(order) = self
            .orders
            .iter()
            .find(|o| o.context.store_id == store_id && o.idempotency_key == idempotency_key)
        {
            return Ok(Some(order.clone()));
        }
        self.database
            .find_order_by_idempotency_key(store_id, idempotency_key)
            .await
    }

    async fn allocate_invoice_number(
        &mut self,
        store_id: i64,
        prefix: &str,
    ) -> Result<InvoiceNumber, database::Error> {
        self.lock_store(store_id).await?;

        let key = (store_id, prefix.to_string());
        let last = match self.staged_counter(&key) {
            Some(n) => n,
            None => self
                .database
                .lock()?
                .invoice_counters
                .get(&key)
                .copied()
                .unwrap_or(0),
        };
        let number = last + 1;
        self.counters.push((key, number));

        Ok(InvoiceNumber {
            series: prefix.to_string(),
            number,
        })
    }

    async fn create_pass_records(
        &mut self,
        purchase: &PassPurchase,
    ) -> Result<PassRecords, database::Error> {
        let store_id = purchase.context.store_id;
        self.lock_store(store_id).await?;

        let mut state = self.database.lock()?;
        #[cfg(test)]
        if state.fail_record_writes {
            return Err(database::Error::Adapter("record writes disabled".into()));
        }
        if state
            .find_order(store_id, &purchase.idempotency_key)
            .is_some()
            || self.orders.iter().any(|o| {
                o.context.store_id == store_id && o.idempotency_key == purchase.idempotency_key
            })
        {
            return Err(database::Error::DuplicateIdempotencyKey {
                store_id,
                idempotency_key: purchase.idempotency_key.clone(),
            });
        }
        if state.invoice_issued(store_id, &purchase.invoice)
            || self
                .orders
                .iter()
                .any(|o| o.context.store_id == store_id && o.invoice == purchase.invoice)
        {
            return Err(database::Error::InvoiceNumberTaken(purchase.invoice.clone()));
        }

        let order_id = state.next_id();
        let pass_id = state.next_id();
        drop(state);

        self.orders.push(TopupOrder {
            order_id,
            pass_id,
            context: purchase.context,
            member_id: purchase.member_id,
            pass_plan_id: purchase.pass_plan_id,
            sale_sku: purchase.sale_sku.clone(),
            payment_method: purchase.payment_method,
            idempotency_key: purchase.idempotency_key.clone(),
            invoice: purchase.invoice.clone(),
            amount: purchase.amount,
            created_at: purchase.purchased_at,
        });
        self.passes.push(MemberPass {
            member_pass_id: pass_id,
            member_id: purchase.member_id,
            pass_plan_id: purchase.pass_plan_id,
            remaining_uses: purchase.remaining_uses,
            purchased_at: purchase.purchased_at,
            expires_at: purchase.expires_at,
            topup_order_id: order_id,
            status: PassStatus::Active,
        });

        Ok(PassRecords { order_id, pass_id })
    }

    async fn commit(self) -> Result<(), database::Error> {
        let mut state = self.database.lock()?;

        // Same checks the unique indexes would run at commit time
        for order in &self.orders {
            if state
                .find_order(order.context.store_id, &order.idempotency_key)
                .is_some()
            {
                return Err(database::Error::DuplicateIdempotencyKey {
                    store_id: order.context.store_id,
                    idempotency_key: order.idempotency_key.clone(),
                });
            }
            if state.invoice_issued(order.context.store_id, &order.invoice) {
                return Err(database::Error::InvoiceNumberTaken(order.invoice.clone()));
            }
        }

        for (key, number) in self.counters {
            let counter = state.invoice_counters.entry(key).or_default();
            *counter = (*counter).max(number);
        }
        let written = self.orders.len();
        state.orders.extend(self.orders);
        state.passes.extend(self.passes);
        tracing::debug!(orders = written, "memory transaction committed");

        // The store lock is released when `self.store_lock` drops, after the state is updated
        drop(state);
        Ok(())
    }

    async fn rollback(self) -> Result<(), database::Error> {
        Ok(())
    }
}

/// Erased [`PoisonError`]
///
/// `PoisonError` keeps the `MutexGuard` internally, which is not send. Thus we erase the error
/// and only keep the string representation instead.
#[derive(Debug, thiserror::Error)]
#[error("poison error: {0}")]
pub struct ErasedPoisonError(String);

impl<T> From<PoisonError<T>> for ErasedPoisonError {
    fn from(err: PoisonError<T>) -> Self {
        Self(err.to_string())
    }
}

/// We need to create custom `From` implementations here for an error that's specific to this
/// adapter.
macro_rules! impl_from_poison {
    ($($error:ty),*) => {
        $(
            impl From<ErasedPoisonError> for $error {
                fn from(err: ErasedPoisonError) -> Self {
                    Self::Adapter(Box::new(err))
                }
            }
        )*
    };
}

impl_from_poison!(database::Error, member::Error, plan::Error, store::Error);
