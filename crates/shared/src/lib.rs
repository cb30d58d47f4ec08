#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Squarelet shared types and infrastructure
//!
//! Domain records (organizations, plans, entitlements, memberships), strongly
//! typed identifiers, environment configuration and database setup used by the
//! billing core and the worker.

pub mod config;
pub mod db;
pub mod types;

pub use config::{Config, ConfigError, ProviderKind};
pub use db::{create_pool, run_migrations};
pub use types::*;
