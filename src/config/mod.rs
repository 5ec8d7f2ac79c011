//! Catalog persistence and live reload.

pub mod catalog;
pub mod watcher;

pub use catalog::{Catalog, ServerConfig, BASE_PORT};
pub use watcher::{spawn_watcher, CatalogChange};
