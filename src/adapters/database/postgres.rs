//! PostgreSQL implementation of the storage ports
//!
//! Schema lives in `migrations/`. Invoice numbers come from `invoice_counters`: the upsert that
//! bumps a counter keeps its row locked until the transaction ends, so concurrent purchases in
//! the same store and series queue up behind each other and a rollback gives the number back.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Postgres,
};
use uuid::Uuid;

use crate::{
    config::{Config, ConfigError},
    domain::{
        InvoiceNumber, MemberPass, MemberRow, NewMember, PassPlan, PassPurchase, PassRecords,
        PassStatus, PaymentMethod, RequestContext, TopupOrder,
    },
    ports::{
        database::{self, DatabasePort, TransactionPort},
        member::{self, MemberPort},
        plan::{self, PlanPort},
        store::{self, StoreConfig, StorePort},
    },
};

const ACTIVE_PHONE_KEY: &str = "pos_members_active_phone_key";
const IDEMPOTENCY_KEY: &str = "topup_orders_idempotency_key";
const INVOICE_KEY: &str = "topup_orders_invoice_key";

const SELECT_MEMBER: &str = r#"
    SELECT m.id, m.member_uuid, m.first_name, m.last_name, m.phone_number, m.email,
           to_char(m.birthdate, 'YYYY-MM-DD') AS birthdate,
           m.member_level_id, l.level_name_zh, l.level_name_es,
           m.points_balance, m.is_active,
           to_char(m.created_at AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS') AS created_at,
           to_char(m.updated_at AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS') AS updated_at
    FROM pos_members m
    LEFT JOIN pos_member_levels l ON l.level_id = m.member_level_id
"#;

const SELECT_PLAN: &str = r#"
    SELECT pass_plan_id, name, name_zh, name_es, total_uses, validity_days,
           max_uses_per_order, max_uses_per_day, sale_sku, sale_price, notes,
           important_notice_zh, important_notice_es, is_active
    FROM pass_plans
"#;

const SELECT_ORDER_BY_KEY: &str = r#"
    SELECT o.order_id, p.member_pass_id AS pass_id, o.store_id, o.device_id, o.user_id,
           o.member_id, o.pass_plan_id, o.sale_sku, o.payment_method, o.idempotency_key,
           o.invoice_series, o.invoice_number, o.amount, o.created_at
    FROM topup_orders o
    JOIN member_passes p ON p.topup_order_id = o.order_id
    WHERE o.store_id = $1 AND o.idempotency_key = $2
"#;

#[derive(Clone, Debug)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized from the configuration
    pub async fn connect(config: &Config) -> Result<Self, PostgresError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(config.database_url()?)
            .await?;
        tracing::info!(
            max_connections = config.db_max_connections,
            "connected to postgres"
        );
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), PostgresError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MemberPort for PostgresDatabase {
    async fn find_active_by_phone(&self, phone: &str) -> Result<Option<MemberRow>, member::Error> {
        let row = sqlx::query_as::<_, MemberRecord>(&format!(
            "{SELECT_MEMBER} WHERE btrim(m.phone_number) = $1 AND m.is_active LIMIT 1"
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MemberRow::from))
    }

    async fn get_member_by_id(&self, member_id: i64) -> Result<Option<MemberRow>, member::Error> {
        let row = sqlx::query_as::<_, MemberRecord>(&format!("{SELECT_MEMBER} WHERE m.id = $1"))
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(MemberRow::from))
    }

    async fn insert_member(&self, new: NewMember) -> Result<i64, member::Error> {
        let res = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pos_members
                (member_uuid, first_name, last_name, phone_number, email, birthdate,
                 member_level_id, points_balance, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $9)
            RETURNING id
            "#,
        )
        .bind(new.member_uuid)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.phone_number)
        .bind(&new.email)
        .bind(new.birthdate)
        .bind(new.member_level_id)
        .bind(new.points_balance)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await;

        match res {
            Ok(id) => Ok(id),
            Err(err) if violates(&err, ACTIVE_PHONE_KEY) => {
                Err(member::Error::DuplicatePhone(new.phone_number))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_member_active_passes(
        &self,
        member_id: i64,
        today: NaiveDate,
    ) -> Result<Vec<MemberPass>, member::Error> {
        let rows = sqlx::query_as::<_, PassRecord>(
            r#"
            SELECT member_pass_id, member_id, pass_plan_id, remaining_uses, purchased_at,
                   expires_at, topup_order_id, status
            FROM member_passes
            WHERE member_id = $1
              AND status = 'active'
              AND remaining_uses > 0
              AND expires_at >= $2
            ORDER BY expires_at
            "#,
        )
        .bind(member_id)
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(MemberPass::try_from)
            .collect::<Result<_, _>>()?)
    }
}

#[async_trait::async_trait]
impl PlanPort for PostgresDatabase {
    async fn list_active_plans(&self) -> Result<Vec<PassPlan>, plan::Error> {
        let rows = sqlx::query_as::<_, PlanRecord>(&format!(
            "{SELECT_PLAN} WHERE is_active ORDER BY sale_price ASC, pass_plan_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(PassPlan::try_from)
            .collect::<Result<_, _>>()?)
    }

    async fn get_pass_plan_by_sku(&self, sku: &str) -> Result<Option<PassPlan>, plan::Error> {
        let row = sqlx::query_as::<_, PlanRecord>(&format!("{SELECT_PLAN} WHERE sale_sku = $1"))
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PassPlan::try_from).transpose()?)
    }
}

#[async_trait::async_trait]
impl StorePort for PostgresDatabase {
    async fn ensure_active_shift(&self, store_id: i64, device_id: i64) -> Result<(), store::Error> {
        let open = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM pos_shifts
                WHERE store_id = $1 AND device_id = $2 AND closed_at IS NULL
            )
            "#,
        )
        .bind(store_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        if open {
            Ok(())
        } else {
            Err(store::Error::NoActiveShift {
                store_id,
                device_id,
            })
        }
    }

    async fn get_store_config(&self, store_id: i64) -> Result<Option<StoreConfig>, store::Error> {
        let row = sqlx::query_as::<_, StoreConfigRecord>(
            "SELECT store_id, store_name, invoice_prefix FROM store_configs WHERE store_id = $1",
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoreConfig {
            store_id: r.store_id,
            store_name: r.store_name,
            invoice_prefix: r.invoice_prefix,
        }))
    }
}

#[async_trait::async_trait]
impl DatabasePort for PostgresDatabase {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction, database::Error> {
        Ok(PostgresTransaction {
            tx: self.pool.begin().await?,
        })
    }

    async fn find_order_by_idempotency_key(
        &self,
        store_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<TopupOrder>, database::Error> {
        let row = sqlx::query_as::<_, OrderRecord>(SELECT_ORDER_BY_KEY)
            .bind(store_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(TopupOrder::try_from).transpose()?)
    }
}

pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl TransactionPort for PostgresTransaction {
    async fn find_order_by_idempotency_key(
        &mut self,
        store_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<TopupOrder>, database::Error> {
        let row = sqlx::query_as::<_, OrderRecord>(SELECT_ORDER_BY_KEY)
            .bind(store_id)
            .bind(idempotency_key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(TopupOrder::try_from).transpose()?)
    }

    async fn allocate_invoice_number(
        &mut self,
        store_id: i64,
        prefix: &str,
    ) -> Result<InvoiceNumber, database::Error> {
        let number = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO invoice_counters (store_id, series, last_number)
            VALUES ($1, $2, 1)
            ON CONFLICT (store_id, series)
            DO UPDATE SET last_number = invoice_counters.last_number + 1
            RETURNING last_number
            "#,
        )
        .bind(store_id)
        .bind(prefix)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(InvoiceNumber {
            series: prefix.to_string(),
            number: u64::try_from(number).map_err(|_| PostgresError::OutOfRange {
                column: "invoice_counters.last_number",
                value: number.to_string(),
            })?,
        })
    }

    async fn create_pass_records(
        &mut self,
        purchase: &PassPurchase,
    ) -> Result<PassRecords, database::Error> {
        let invoice_number =
            i64::try_from(purchase.invoice.number).map_err(|_| PostgresError::OutOfRange {
                column: "topup_orders.invoice_number",
                value: purchase.invoice.number.to_string(),
            })?;

        let res = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO topup_orders
                (store_id, device_id, user_id, member_id, pass_plan_id, sale_sku, quantity,
                 payment_method, idempotency_key, invoice_series, invoice_number, amount,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING order_id
            "#,
        )
        .bind(purchase.context.store_id)
        .bind(purchase.context.device_id)
        .bind(purchase.context.user_id)
        .bind(purchase.member_id)
        .bind(purchase.pass_plan_id)
        .bind(&purchase.sale_sku)
        .bind(signed("topup_orders.quantity", purchase.quantity)?)
        .bind(purchase.payment_method.as_str())
        .bind(&purchase.idempotency_key)
        .bind(&purchase.invoice.series)
        .bind(invoice_number)
        .bind(purchase.amount)
        .bind(purchase.purchased_at)
        .fetch_one(&mut *self.tx)
        .await;

        let order_id = match res {
            Ok(order_id) => order_id,
            Err(err) if violates(&err, IDEMPOTENCY_KEY) => {
                return Err(database::Error::DuplicateIdempotencyKey {
                    store_id: purchase.context.store_id,
                    idempotency_key: purchase.idempotency_key.clone(),
                })
            }
            Err(err) if violates(&err, INVOICE_KEY) => {
                return Err(database::Error::InvoiceNumberTaken(purchase.invoice.clone()))
            }
            Err(err) => return Err(err.into()),
        };

        let pass_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO member_passes
                (member_id, pass_plan_id, remaining_uses, purchased_at, expires_at,
                 topup_order_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING member_pass_id
            "#,
        )
        .bind(purchase.member_id)
        .bind(purchase.pass_plan_id)
        .bind(signed("member_passes.remaining_uses", purchase.remaining_uses)?)
        .bind(purchase.purchased_at)
        .bind(purchase.expires_at)
        .bind(order_id)
        .bind(PassStatus::Active.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(PassRecords { order_id, pass_id })
    }

    async fn commit(self) -> Result<(), database::Error> {
        Ok(self.tx.commit().await?)
    }

    async fn rollback(self) -> Result<(), database::Error> {
        Ok(self.tx.rollback().await?)
    }
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn unsigned(column: &'static str, value: i32) -> Result<u32, PostgresError> {
    u32::try_from(value).map_err(|_| PostgresError::OutOfRange {
        column,
        value: value.to_string(),
    })
}

fn signed(column: &'static str, value: u32) -> Result<i32, PostgresError> {
    i32::try_from(value).map_err(|_| PostgresError::OutOfRange {
        column,
        value: value.to_string(),
    })
}

#[derive(Debug, sqlx::FromRow)]
struct MemberRecord {
    id: i64,
    member_uuid: Uuid,
    first_name: String,
    last_name: String,
    phone_number: String,
    email: Option<String>,
    birthdate: Option<String>,
    member_level_id: Option<i64>,
    level_name_zh: Option<String>,
    level_name_es: Option<String>,
    points_balance: Decimal,
    is_active: bool,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl From<MemberRecord> for MemberRow {
    fn from(r: MemberRecord) -> Self {
        Self {
            id: r.id,
            member_uuid: r.member_uuid,
            first_name: r.first_name,
            last_name: r.last_name,
            phone_number: r.phone_number,
            email: r.email,
            birthdate: r.birthdate,
            member_level_id: r.member_level_id,
            level_name_zh: r.level_name_zh,
            level_name_es: r.level_name_es,
            points_balance: r.points_balance,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRecord {
    pass_plan_id: i64,
    name: String,
    name_zh: Option<String>,
    name_es: Option<String>,
    total_uses: i32,
    validity_days: i32,
    max_uses_per_order: Option<i32>,
    max_uses_per_day: Option<i32>,
    sale_sku: String,
    sale_price: Decimal,
    notes: Option<String>,
    important_notice_zh: Option<String>,
    important_notice_es: Option<String>,
    is_active: bool,
}

impl TryFrom<PlanRecord> for PassPlan {
    type Error = PostgresError;

    fn try_from(r: PlanRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            pass_plan_id: r.pass_plan_id,
            name: r.name,
            name_zh: r.name_zh,
            name_es: r.name_es,
            total_uses: unsigned("pass_plans.total_uses", r.total_uses)?,
            validity_days: unsigned("pass_plans.validity_days", r.validity_days)?,
            max_uses_per_order: r
                .max_uses_per_order
                .map(|v| unsigned("pass_plans.max_uses_per_order", v))
                .transpose()?,
            max_uses_per_day: r
                .max_uses_per_day
                .map(|v| unsigned("pass_plans.max_uses_per_day", v))
                .transpose()?,
            sale_sku: r.sale_sku,
            sale_price: r.sale_price,
            notes: r.notes,
            important_notice_zh: r.important_notice_zh,
            important_notice_es: r.important_notice_es,
            is_active: r.is_active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PassRecord {
    member_pass_id: i64,
    member_id: i64,
    pass_plan_id: i64,
    remaining_uses: i32,
    purchased_at: DateTime<Utc>,
    expires_at: NaiveDate,
    topup_order_id: i64,
    status: String,
}

impl TryFrom<PassRecord> for MemberPass {
    type Error = PostgresError;

    fn try_from(r: PassRecord) -> Result<Self, Self::Error> {
        let status = PassStatus::parse(&r.status).ok_or_else(|| PostgresError::Invalid {
            column: "member_passes.status",
            value: r.status.clone(),
        })?;

        Ok(Self {
            member_pass_id: r.member_pass_id,
            member_id: r.member_id,
            pass_plan_id: r.pass_plan_id,
            remaining_uses: unsigned("member_passes.remaining_uses", r.remaining_uses)?,
            purchased_at: r.purchased_at,
            expires_at: r.expires_at,
            topup_order_id: r.topup_order_id,
            status,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StoreConfigRecord {
    store_id: i64,
    store_name: String,
    invoice_prefix: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRecord {
    order_id: i64,
    pass_id: i64,
    store_id: i64,
    device_id: i64,
    user_id: i64,
    member_id: i64,
    pass_plan_id: i64,
    sale_sku: String,
    payment_method: String,
    idempotency_key: String,
    invoice_series: String,
    invoice_number: i64,
    amount: Decimal,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRecord> for TopupOrder {
    type Error = PostgresError;

    fn try_from(r: OrderRecord) -> Result<Self, Self::Error> {
        let payment_method =
            PaymentMethod::parse(&r.payment_method).ok_or_else(|| PostgresError::Invalid {
                column: "topup_orders.payment_method",
                value: r.payment_method.clone(),
            })?;
        let number = u64::try_from(r.invoice_number).map_err(|_| PostgresError::OutOfRange {
            column: "topup_orders.invoice_number",
            value: r.invoice_number.to_string(),
        })?;

        Ok(Self {
            order_id: r.order_id,
            pass_id: r.pass_id,
            context: RequestContext {
                store_id: r.store_id,
                device_id: r.device_id,
                user_id: r.user_id,
            },
            member_id: r.member_id,
            pass_plan_id: r.pass_plan_id,
            sale_sku: r.sale_sku,
            payment_method,
            idempotency_key: r.idempotency_key,
            invoice: InvoiceNumber {
                series: r.invoice_series,
                number,
            },
            amount: r.amount,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{column} out of range: {value}")]
    OutOfRange { column: &'static str, value: String },
    #[error("{column} has unexpected value {value:?}")]
    Invalid { column: &'static str, value: String },
}

macro_rules! impl_from_postgres {
    ($($error:ty),*) => {
        $(
            impl From<PostgresError> for $error {
                fn from(err: PostgresError) -> Self {
                    Self::Adapter(Box::new(err))
                }
            }

            impl From<sqlx::Error> for $error {
                fn from(err: sqlx::Error) -> Self {
                    PostgresError::from(err).into()
                }
            }
        )*
    };
}

impl_from_postgres!(database::Error, member::Error, plan::Error, store::Error);
