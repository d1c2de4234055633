//! Core data types for the billing engine

pub mod events;
pub mod filter;
pub mod range;
pub mod reference;
