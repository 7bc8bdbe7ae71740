use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use chrono::Utc;
use serde::Deserialize;
use tower::Service;

use crate::{domain::Member, ports::member::MemberPort};

use super::{DomainLogic, Error};

#[derive(Clone, Debug, Deserialize)]
pub struct FindMemberRequest {
    pub phone: String,
}

impl<D, M, P, S, R, I> Service<FindMemberRequest> for DomainLogic<D, M, P, S, R, I>
where
    M: MemberPort + Send + Sync + 'static,
{
    type Response = Member;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: FindMemberRequest) -> Self::Future {
        let member = self.member.clone();
        Box::pin(async move { find_member(member.as_ref(), &req.phone).await })
    }
}

async fn find_member<M: MemberPort>(member_port: &M, phone: &str) -> Result<Member, Error> {
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(Error::Validation("phone number is required".into()));
    }

    let row = member_port
        .find_active_by_phone(phone)
        .await?
        .ok_or_else(|| Error::NotFound("member not found".into()))?;
    let mut member = Member::from(row);

    // Passes are a convenience for the POS; a failing lookup must not hide the member
    let today = Utc::now().date_naive();
    member.passes = match member_port.get_member_active_passes(member.id, today).await {
        Ok(passes) => passes,
        Err(err) => {
            tracing::warn!(member_id = member.id, error = %err, "could not load member passes");
            Vec::new()
        }
    };

    Ok(member)
}
