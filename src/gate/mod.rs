//! Protocol-facing adapter around the rate limiter.
//!
//! The limiter core does not depend on this module.

mod admin;
mod service;

pub use admin::{AdminService, ResetRequest, ResetResponse, StatsResponse};
pub use service::{
    endpoint_class_for_path, AdmissionGate, CallerIdentity, GateResponse, RejectionBody,
    ANONYMOUS, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER, STATUS_OK,
    STATUS_TOO_MANY_REQUESTS,
};
