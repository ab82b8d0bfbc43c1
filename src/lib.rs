//! Quotagate - Distributed Rate Limiting Middleware
//!
//! This crate enforces per-client request quotas across a fleet of stateless
//! HTTP servers. Every instance coordinates through a shared counter store
//! (Redis in production), so a client's quota is global to the fleet rather
//! than per process.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod web;
