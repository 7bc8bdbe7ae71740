//! POS backend for members and prepaid passes
//!
//! Member lookup and registration, the pass plan catalog, and the pass purchase workflow with
//! gapless fiscal invoice numbers and idempotent submissions.
//!
//! The domain logic only talks to the traits in [`ports`]. [`adapters`] holds an in-memory
//! implementation of all of them, and a PostgreSQL one behind the `postgres` feature.
//!
//! ```ignore
//! let config = Config::from_env()?;
//! logger::init_logger(&config.log_level)?;
//!
//! let database = Arc::new(MemoryDatabase::default());
//! let mut logic = DomainLogic::new(
//!     database.clone(),
//!     database.clone(),
//!     database.clone(),
//!     database,
//!     Arc::new(PurchaseLimits::new()),
//!     Arc::new(UuidV4Generator),
//! )
//! .with_idempotency_policy(config.idempotency_policy);
//!
//! let plans = logic.ready().await?.call(ListPassPlansRequest).await?;
//! ```

pub mod adapters;
pub mod commands;
pub mod config;
pub mod domain;
pub mod logger;
pub mod ports;
pub mod response;

pub use commands::{DomainLogic, Error};
pub use config::{Config, IdempotencyPolicy};
