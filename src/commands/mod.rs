use std::{borrow::Cow, sync::Arc};

use crate::{
    config::IdempotencyPolicy,
    domain::{LocalizedMessage, Violation},
    ports::{database, member, plan, rules, store},
};

pub mod create_member;
pub mod find_member;
pub mod list_pass_plans;
pub mod purchase_pass;

/// Domain logic, wired to its collaborators
///
/// Every command is a [`tower::Service`] implementation on this type, bounded only by the ports
/// it actually uses.
pub struct DomainLogic<D, M, P, S, R, I> {
    database: Arc<D>,
    member: Arc<M>,
    plan: Arc<P>,
    store: Arc<S>,
    rules: Arc<R>,
    ids: Arc<I>,
    idempotency: IdempotencyPolicy,
}

impl<D, M, P, S, R, I> DomainLogic<D, M, P, S, R, I> {
    pub fn new(
        database: Arc<D>,
        member: Arc<M>,
        plan: Arc<P>,
        store: Arc<S>,
        rules: Arc<R>,
        ids: Arc<I>,
    ) -> Self {
        Self {
            database,
            member,
            plan,
            store,
            rules,
            ids,
            idempotency: IdempotencyPolicy::default(),
        }
    }

    /// How a repeated purchase idempotency key is answered
    pub fn with_idempotency_policy(mut self, policy: IdempotencyPolicy) -> Self {
        self.idempotency = policy;
        self
    }
}

impl<D, M, P, S, R, I> Clone for DomainLogic<D, M, P, S, R, I> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            member: self.member.clone(),
            plan: self.plan.clone(),
            store: self.store.clone(),
            rules: self.rules.clone(),
            ids: self.ids.clone(),
            idempotency: self.idempotency,
        }
    }
}

/// Swap single collaborators, e.g. for a mock
#[cfg(test)]
impl<D, M, P, S, R, I> DomainLogic<D, M, P, S, R, I> {
    pub(crate) fn with_database<D2>(self, database: D2) -> DomainLogic<D2, M, P, S, R, I> {
        DomainLogic {
            database: Arc::new(database),
            member: self.member,
            plan: self.plan,
            store: self.store,
            rules: self.rules,
            ids: self.ids,
            idempotency: self.idempotency,
        }
    }

    pub(crate) fn with_member<M2>(self, member: M2) -> DomainLogic<D, M2, P, S, R, I> {
        DomainLogic {
            database: self.database,
            member: Arc::new(member),
            plan: self.plan,
            store: self.store,
            rules: self.rules,
            ids: self.ids,
            idempotency: self.idempotency,
        }
    }

    pub(crate) fn with_plan<P2>(self, plan: P2) -> DomainLogic<D, M, P2, S, R, I> {
        DomainLogic {
            database: self.database,
            member: self.member,
            plan: Arc::new(plan),
            store: self.store,
            rules: self.rules,
            ids: self.ids,
            idempotency: self.idempotency,
        }
    }

    pub(crate) fn with_rules<R2>(self, rules: R2) -> DomainLogic<D, M, P, S, R2, I> {
        DomainLogic {
            database: self.database,
            member: self.member,
            plan: self.plan,
            store: self.store,
            rules: Arc::new(rules),
            ids: self.ids,
            idempotency: self.idempotency,
        }
    }

    pub(crate) fn with_ids<I2>(self, ids: I2) -> DomainLogic<D, M, P, S, R, I2> {
        DomainLogic {
            database: self.database,
            member: self.member,
            plan: self.plan,
            store: self.store,
            rules: self.rules,
            ids: Arc::new(ids),
            idempotency: self.idempotency,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Missing or malformed input
    #[error("invalid request: {0}")]
    Validation(Cow<'static, str>),
    #[error("not found: {0}")]
    NotFound(Cow<'static, str>),
    /// Uniqueness violation, e.g. a phone number already in use
    #[error("conflict: {0}")]
    Conflict(Cow<'static, str>),
    /// Rejected by a business rule, with a message for the operator
    #[error("business rule violation: {0}")]
    BusinessRule(Violation),
    /// Misconfiguration or an impossible state
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),

    #[error("database port error: {0:?}")]
    Database(#[from] database::Error),
    #[error("member port error: {0:?}")]
    Member(#[from] member::Error),
    #[error("plan port error: {0:?}")]
    Plan(#[from] plan::Error),
    #[error("store port error: {0:?}")]
    Store(store::Error),
    #[error("rules port error: {0:?}")]
    Rules(rules::Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        match err {
            store::Error::NoActiveShift { .. } => Self::BusinessRule(Violation::no_active_shift()),
            err => Self::Store(err),
        }
    }
}

impl From<rules::Error> for Error {
    fn from(err: rules::Error) -> Self {
        match err {
            rules::Error::Violation(violation) => Self::BusinessRule(violation),
            err => Self::Rules(err),
        }
    }
}

/// Error categories exposed to clients
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    BusinessRule,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::BusinessRule => "BUSINESS_RULE_VIOLATION",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the gateway should answer with
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::BusinessRule => 422,
            ErrorKind::Internal => 500,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_)
            | Error::Member(member::Error::DuplicatePhone(_))
            | Error::Database(database::Error::DuplicateIdempotencyKey { .. }) => {
                ErrorKind::Conflict
            }
            Error::BusinessRule(_) => ErrorKind::BusinessRule,
            Error::Internal(_)
            | Error::Database(_)
            | Error::Member(_)
            | Error::Plan(_)
            | Error::Store(_)
            | Error::Rules(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> u16 {
        self.kind().status()
    }

    /// Bilingual text for errors shown to the operator
    pub fn localized(&self) -> Option<&LocalizedMessage> {
        match self {
            Error::BusinessRule(violation) => Some(&violation.message),
            _ => None,
        }
    }
}
