pub mod circuits;
pub mod health;
pub mod metrics;
pub mod sagas;
