//! Operator surface: reset a caller's penalty, inspect store usage.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ratelimit::{EndpointClass, RateLimiter, StoreStats, Tier, WindowStore};

/// Reset request. Without an endpoint class every class is cleared.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub identifier: String,
    #[serde(default)]
    pub endpoint_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsResponse {
    pub stats: StoreStats,
    pub endpoints: Vec<EndpointClass>,
    pub tiers: Vec<Tier>,
}

pub struct AdminService<S: WindowStore> {
    limiter: Arc<RateLimiter<S>>,
}

impl<S: WindowStore> AdminService<S> {
    pub fn new(limiter: Arc<RateLimiter<S>>) -> Self {
        Self { limiter }
    }

    pub async fn reset(&self, request: &ResetRequest) -> ResetResponse {
        let identifier = request.identifier.trim();
        if identifier.is_empty() {
            return ResetResponse {
                success: false,
                message: "identifier is required".to_string(),
            };
        }

        let classes: Vec<String> = match request.endpoint_class.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => vec![name.to_ascii_lowercase()],
            _ => EndpointClass::ALL.iter().map(|c| c.to_string()).collect(),
        };

        let results = join_all(
            classes
                .iter()
                .map(|class| self.limiter.reset(identifier, class)),
        )
        .await;

        if let Some(e) = results.into_iter().find_map(|r| r.err()) {
            warn!(identifier = %identifier, error = %e, "Rate limit reset failed");
            return ResetResponse {
                success: false,
                message: format!("Failed to reset rate limit: {}", e),
            };
        }

        let scope = match classes.as_slice() {
            [class] => format!("{} endpoints", class),
            _ => "all endpoints".to_string(),
        };
        info!(identifier = %identifier, scope = %scope, "Admin reset rate limit");

        ResetResponse {
            success: true,
            message: format!("Rate limit reset for {} on {}", identifier, scope),
        }
    }

    /// Store usage plus the known endpoint classes and tiers.
    pub async fn stats(&self) -> crate::error::Result<StatsResponse> {
        let stats = self.limiter.stats().await?;
        Ok(StatsResponse {
            stats,
            endpoints: EndpointClass::ALL.to_vec(),
            tiers: Tier::ALL.to_vec(),
        })
    }
}
