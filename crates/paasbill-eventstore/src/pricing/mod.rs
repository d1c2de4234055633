//! Pricing
//!
//! - [`formula`]: the pricing formula language
//! - [`composer`]: slicing of usage intervals against versioned reference data

pub mod composer;
pub mod formula;

pub use composer::{charge, compose, compose_all, ComponentSlice};
pub use formula::{Formula, FormulaCache, Vars};
