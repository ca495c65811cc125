//! Gatekeeper - Distributed Admission Control
//!
//! This crate protects a public HTTP API with per-class rate limiters that
//! share their counters through Redis, and escalates repeat offenders from
//! temporary to permanent bans.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
