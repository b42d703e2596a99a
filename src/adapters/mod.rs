//! Adapters
//!
//! Inbound transport and outbound metrics implementations.

pub mod inbound;
pub mod outbound;
