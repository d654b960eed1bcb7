//! Rategate - Tiered Request Admission Control
//!
//! This crate decides, for every inbound API call, whether the caller may
//! proceed. Limits are sliding windows chosen by caller tier and endpoint
//! class, counted either in process memory or in a shared Redis so several
//! service instances enforce one budget. When the shared store is degraded
//! the limiter fails open rather than blocking traffic.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
