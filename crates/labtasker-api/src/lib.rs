//! # labtasker-api
//!
//! HTTP transport for the Labtasker dispatch engine.
//!
//! Maps the wire protocol (JSON request/response bodies, per-queue HTTP
//! Basic authentication) onto engine calls. The transport holds no state of
//! its own beyond live event subscriptions; everything durable lives behind
//! the engine's store.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
