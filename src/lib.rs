//! Tierlimit - Two-Tier Rate Limiting Engine
//!
//! This crate implements fixed-window request admission with a process-local
//! approximate counter in front of an authoritative shared counter store.
//! When the store is unreachable the local tier keeps producing decisions on
//! its own, trading cross-instance exactness for availability.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
