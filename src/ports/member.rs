use chrono::NaiveDate;

use crate::domain::{MemberPass, MemberRow, NewMember};

#[mockall::automock]
#[async_trait::async_trait]
pub trait MemberPort {
    /// Active member whose trimmed phone number equals `phone`
    async fn find_active_by_phone(&self, phone: &str) -> Result<Option<MemberRow>, Error>;
    async fn get_member_by_id(&self, member_id: i64) -> Result<Option<MemberRow>, Error>;
    /// Insert a member and return its storage id
    ///
    /// Phone uniqueness among active members is enforced here, by the storage layer.
    async fn insert_member(&self, member: NewMember) -> Result<i64, Error>;
    /// Passes of the member that are still redeemable on `today`
    async fn get_member_active_passes(
        &self,
        member_id: i64,
        today: NaiveDate,
    ) -> Result<Vec<MemberPass>, Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another active member already uses this phone number
    #[error("phone number {0} already belongs to an active member")]
    DuplicatePhone(String),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
