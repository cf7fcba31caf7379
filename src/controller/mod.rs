//! PostgresUpgrade controller.

pub mod conditions;
pub mod context;
pub mod error;
pub mod gates;
pub mod jobs;
pub mod reconciler;
pub mod registration;
pub mod world;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use gates::{Flow, Work};
pub use reconciler::{error_policy, reconcile};
pub use world::World;
