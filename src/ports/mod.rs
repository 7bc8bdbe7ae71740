//! One trait per collaborator of the domain logic

pub mod database;
pub mod ids;
pub mod member;
pub mod plan;
pub mod rules;
pub mod store;
