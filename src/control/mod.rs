//! The fleet-wide control plane: server, client, and the deployment-agnostic
//! API seam consumed by front-ends.

pub mod api;
pub mod client;
pub mod server;

pub use api::{DirectApi, FleetApi, RemoteApi};
pub use client::ControlClient;
pub use server::{serve, EventHub};
