//! # Tenant Provisioner Library
//!
//! Tenant registration, validation and asynchronous site provisioning through
//! an external toolchain, exposed over an HTTP API.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod provisioning;
pub mod rate_limit;
pub mod repositories;
pub mod server;
pub mod service;
pub mod telemetry;
pub use migration;
