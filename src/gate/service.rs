//! Admission gate: turns limiter decisions into protocol-level responses.
//!
//! Nothing here depends on an HTTP framework. The gate produces a status
//! code, a header list and an optional JSON body that any server layer can
//! copy onto its response.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::ratelimit::{Decision, EndpointClass, RateLimiter, Tier, WindowStore};

/// Identifier used when a caller has neither a principal nor an address.
pub const ANONYMOUS: &str = "anonymous";

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

pub const STATUS_OK: u16 = 200;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// What the protocol layer already knows about the caller.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    /// Authenticated user id
    pub principal_id: Option<String>,
    /// Network address of the connection
    pub remote_addr: Option<IpAddr>,
    /// Role claim, e.g. `admin`
    pub role: Option<String>,
    /// Whether the caller holds a premium subscription
    pub premium: bool,
}

impl CallerIdentity {
    /// Principal id, then network address, then `anonymous`.
    pub fn identifier(&self) -> String {
        if let Some(id) = self.principal_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        match self.remote_addr {
            Some(addr) => addr.to_string(),
            None => ANONYMOUS.to_string(),
        }
    }

    /// `admin` role beats the premium flag; everyone else is free.
    pub fn tier(&self) -> Tier {
        let is_admin = self
            .role
            .as_deref()
            .is_some_and(|role| role.eq_ignore_ascii_case("admin"));

        if is_admin {
            Tier::Admin
        } else if self.premium {
            Tier::Premium
        } else {
            Tier::Free
        }
    }
}

const ROUTES: &[(&str, EndpointClass)] = &[
    ("/api/wallet", EndpointClass::Wallet),
    ("/api/transfer", EndpointClass::Transfer),
    ("/api/payments", EndpointClass::Transfer),
    ("/api/auth", EndpointClass::Auth),
    ("/api/search", EndpointClass::Search),
    ("/api/premium", EndpointClass::Premium),
];

/// Map a request path onto an endpoint class by route prefix.
pub fn endpoint_class_for_path(path: &str) -> EndpointClass {
    ROUTES
        .iter()
        .find(|(prefix, _)| {
            path.strip_prefix(*prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']))
        })
        .map(|(_, class)| *class)
        .unwrap_or(EndpointClass::General)
}

/// JSON body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    pub limit: u64,
    /// Epoch milliseconds
    pub reset_at: u64,
    /// Seconds
    pub retry_after: u64,
}

/// Protocol effects of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RejectionBody>,
}

impl GateResponse {
    /// Informational headers on allow; 429 with `Retry-After` and a body on deny.
    pub fn from_decision(decision: &Decision) -> Self {
        let mut headers = vec![
            (HEADER_LIMIT.to_string(), decision.limit.to_string()),
            (HEADER_REMAINING.to_string(), decision.remaining.to_string()),
            (
                HEADER_RESET.to_string(),
                decision.reset_at.div_ceil(1000).to_string(),
            ),
        ];

        if decision.allowed {
            return Self {
                status: STATUS_OK,
                headers,
                body: None,
            };
        }

        headers.push((HEADER_RETRY_AFTER.to_string(), decision.reset_in.to_string()));
        Self {
            status: STATUS_TOO_MANY_REQUESTS,
            headers,
            body: Some(RejectionBody {
                error: "Too Many Requests".to_string(),
                message: format!(
                    "Rate limit exceeded for {} endpoints. Try again in {} seconds.",
                    decision.endpoint_class, decision.reset_in
                ),
                limit: decision.limit,
                reset_at: decision.reset_at,
                retry_after: decision.reset_in,
            }),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.status == STATUS_TOO_MANY_REQUESTS
    }

    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Runs the whole admission pipeline for a request.
pub struct AdmissionGate<S: WindowStore> {
    limiter: Arc<RateLimiter<S>>,
}

impl<S: WindowStore> AdmissionGate<S> {
    pub fn new(limiter: Arc<RateLimiter<S>>) -> Self {
        Self { limiter }
    }

    /// Check a request from `caller` to `path` and return its decision and
    /// the response effects to apply.
    #[instrument(skip(self, caller))]
    pub async fn admit(&self, caller: &CallerIdentity, path: &str) -> (Decision, GateResponse) {
        let identifier = caller.identifier();
        let tier = caller.tier();
        let endpoint_class = endpoint_class_for_path(path);

        let decision = self
            .limiter
            .check_limit(&identifier, tier, endpoint_class)
            .await;
        let response = GateResponse::from_decision(&decision);

        if response.is_rejection() {
            info!(
                identifier = %identifier,
                endpoint_class = %endpoint_class,
                limit = decision.limit,
                "Request rejected by rate limit"
            );
        } else {
            debug!(
                identifier = %identifier,
                remaining = decision.remaining,
                "Request admitted"
            );
        }

        (decision, response)
    }
}
