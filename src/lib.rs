//! naglfar: a stateless authentication gateway with event-sourced abuse
//! analytics.
//!
//! The gateway issues unsigned pre-auth tokens, verifies HMAC-signed
//! post-auth tokens, and publishes a decision event for every request it
//! arbitrates. The analytics worker consumes those events into a property
//! graph and runs detection queries over it.

pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod gateway;
pub mod graph;
pub mod health;
pub mod metrics;
pub mod token;
pub mod utils;
