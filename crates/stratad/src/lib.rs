#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Stratad library - the security gateway in front of the strata RPC surface
//!
//! Every call passes an ordered interceptor pipeline (metrics, panic
//! recovery, request id, logging, rate limiting, RBAC, audit) before it
//! reaches its handler. Authentication is a public-key challenge-response
//! exchange that opens an opaque-token session; privileged mutations are
//! appended to a hash-chained audit log.

pub mod api;
pub mod audit;
pub mod auth;
pub mod challenge;
pub mod config;
pub mod control_db;
pub mod error;
pub mod log_buffer;
pub mod methods;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod rbac;
pub mod rpc;
pub mod session;
pub mod state;
pub mod users;
