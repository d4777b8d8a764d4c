//! Fuel Coordinator: an automated coordination agent for fuel deliveries.
//!
//! Agents watch their sites' tanks and loads, escalate runout risk, chase
//! carriers for ETAs by email, and learn carrier and site reliability from
//! outcomes.

pub mod agent;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ingest;
pub mod knowledge;
pub mod llm;
pub mod logistics;
pub mod mail;
pub mod pipeline;
pub mod store;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
