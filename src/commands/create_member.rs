use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower::Service;

use crate::{
    domain::{Member, NewMember},
    ports::{
        ids::IdGenerator,
        member::{self, MemberPort},
    },
};

use super::{DomainLogic, Error};

/// Level every new member starts at
const DEFAULT_MEMBER_LEVEL_ID: i64 = 1;

/// Member fields as sent by the POS
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MemberFields {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub birthdate: Option<String>,
}

/// Wire payload for member creation
///
/// Older POS builds send the fields flat, newer ones wrap them in `data`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CreateMemberPayload {
    Wrapped { data: MemberFields },
    Flat(MemberFields),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateMemberRequest {
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    /// `YYYY-MM-DD`
    pub birthdate: Option<String>,
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    Some(trimmed(value)).filter(|v| !v.is_empty())
}

impl From<CreateMemberPayload> for CreateMemberRequest {
    fn from(payload: CreateMemberPayload) -> Self {
        let fields = match payload {
            CreateMemberPayload::Wrapped { data } => data,
            CreateMemberPayload::Flat(fields) => fields,
        };
        Self {
            first_name: trimmed(fields.first_name),
            last_name: trimmed(fields.last_name),
            phone_number: trimmed(fields.phone_number),
            email: non_empty(fields.email),
            birthdate: non_empty(fields.birthdate),
        }
    }
}

impl<D, M, P, S, R, I> Service<CreateMemberRequest> for DomainLogic<D, M, P, S, R, I>
where
    M: MemberPort + Send + Sync + 'static,
    I: IdGenerator + Send + Sync + 'static,
{
    type Response = Member;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateMemberRequest) -> Self::Future {
        let member = self.member.clone();
        let ids = self.ids.clone();
        Box::pin(async move { create_member(member.as_ref(), ids.as_ref(), req).await })
    }
}

async fn create_member<M, I>(
    member_port: &M,
    ids: &I,
    req: CreateMemberRequest,
) -> Result<Member, Error>
where
    M: MemberPort,
    I: IdGenerator,
{
    let phone_number = req.phone_number.trim().to_string();
    if phone_number.is_empty() {
        return Err(Error::Validation("phone number is required".into()));
    }
    let birthdate = req
        .birthdate
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| Error::Validation(format!("invalid birthdate: {raw}").into()))
        })
        .transpose()?;

    let new_member = NewMember {
        member_uuid: ids.new_uuid(),
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
        phone_number,
        email: req
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty()),
        birthdate,
        member_level_id: DEFAULT_MEMBER_LEVEL_ID,
        points_balance: Decimal::ZERO,
        // Reports join members across stores in different time zones
        created_at: Utc::now(),
    };

    let member_id = match member_port.insert_member(new_member).await {
        Ok(id) => id,
        Err(member::Error::DuplicatePhone(phone)) => {
            tracing::warn!(phone = %phone, "member creation rejected: phone already registered");
            return Err(Error::Conflict("phone number already exists".into()));
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to create member");
            return Err(err.into());
        }
    };

    let row = member_port
        .get_member_by_id(member_id)
        .await?
        .ok_or_else(|| {
            Error::Internal(format!("created member {member_id} could not be read back").into())
        })?;
    tracing::info!(member_id, "member created");

    // New members have no passes yet
    Ok(Member::from(row))
}
