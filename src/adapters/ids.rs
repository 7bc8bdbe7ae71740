use uuid::Uuid;

use crate::ports::ids::IdGenerator;

/// Random (v4) UUIDs
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidV4Generator;

impl IdGenerator for UuidV4Generator {
    fn new_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }
}
