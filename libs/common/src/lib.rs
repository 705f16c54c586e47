//! Common library for the Plaza marketplace
//!
//! This crate provides shared infrastructure used across the Plaza
//! services: PostgreSQL connectivity, Redis caching, and the error
//! types both of them surface.

pub mod cache;
pub mod database;
pub mod error;
