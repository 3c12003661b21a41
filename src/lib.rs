//! Monitoring and control plane for a multi-tenant node proxy.
//!
//! The proxy core reports per-request metrics and health-probe outcomes
//! into the stores here; the scheduler rolls them up and enforces
//! retention; the hub pushes live events to per-tenant WebSocket clients;
//! the web edge exposes history, settings and the socket endpoint.

pub mod cache;
pub mod config;
pub mod hub;
pub mod scheduler;
pub mod store;
pub mod timeutil;
pub mod version;
pub mod web;
