//! `textguard-core`: shared building blocks for the prediction pipeline.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{DeliveryId, PredictionId, RequestId};
pub use value_object::ValueObject;
