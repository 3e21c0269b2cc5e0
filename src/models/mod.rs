//! # Data Models
//!
//! SeaORM entities for persisted weighting output.

pub mod response_weight;
pub mod response_weighting_context;

pub use response_weight::Entity as ResponseWeightConfiguration;
pub use response_weighting_context::Entity as ResponseWeightingContext;
