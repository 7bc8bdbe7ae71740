//! Concrete implementations of the ports

pub mod database;
pub mod ids;
pub mod rules;
