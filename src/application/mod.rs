//! Application Layer
//!
//! Use cases built on the domain ports and infrastructure limiters.

pub mod admission;
pub mod app;

pub use admission::{AdmissionService, Request, Response};
pub use app::{App, AppState, ComponentFailure, LifecycleError, ShutdownError};
