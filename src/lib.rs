//! ERPlink — library crate for integration testing.
//!
//! Re-exports modules needed by integration tests in `tests/`.

pub mod broker;
pub mod cache;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod rpc;
pub mod store;
