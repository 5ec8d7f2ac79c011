//! Domain types shared across the crate: models, errors and events.

pub mod errors;
pub mod events;
pub mod models;
