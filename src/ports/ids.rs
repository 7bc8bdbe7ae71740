use uuid::Uuid;

#[mockall::automock]
pub trait IdGenerator {
    /// A globally unique identifier
    fn new_uuid(&self) -> Uuid;
}
