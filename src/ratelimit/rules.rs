//! Policy table: caller tier and endpoint class to window limits.
//!
//! The built-in table covers three tiers and six endpoint classes. A YAML file
//! can override individual entries at startup; the table is read-only after
//! that. Lookups never fail: an unknown tier is treated as `free` and an
//! unknown endpoint class as `general`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{GateError, Result};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const QUARTER_HOUR_MS: u64 = 15 * MINUTE_MS;

/// Caller classification selecting which limits apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Admin,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Premium, Tier::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }

    /// Parse a tier name, treating anything unrecognized as `free`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "premium" => Tier::Premium,
            "admin" => Tier::Admin,
            _ => Tier::Free,
        }
    }
}

impl From<&str> for Tier {
    fn from(name: &str) -> Self {
        Tier::from_name(name)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical group of API routes sharing one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    General,
    Wallet,
    Premium,
    Transfer,
    Auth,
    Search,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 6] = [
        EndpointClass::General,
        EndpointClass::Wallet,
        EndpointClass::Premium,
        EndpointClass::Transfer,
        EndpointClass::Auth,
        EndpointClass::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::General => "general",
            EndpointClass::Wallet => "wallet",
            EndpointClass::Premium => "premium",
            EndpointClass::Transfer => "transfer",
            EndpointClass::Auth => "auth",
            EndpointClass::Search => "search",
        }
    }

    /// Parse an endpoint class name, treating anything unrecognized as `general`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "wallet" => EndpointClass::Wallet,
            "premium" => EndpointClass::Premium,
            "transfer" => EndpointClass::Transfer,
            "auth" => EndpointClass::Auth,
            "search" => EndpointClass::Search,
            _ => EndpointClass::General,
        }
    }
}

impl From<&str> for EndpointClass {
    fn from(name: &str) -> Self {
        EndpointClass::from_name(name)
    }
}

impl AsRef<str> for EndpointClass {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window length and the number of events allowed inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub window_ms: u64,
    pub max: u64,
}

impl Limit {
    pub const fn new(window_ms: u64, max: u64) -> Self {
        Self { window_ms, max }
    }
}

/// Override file layout:
///
/// ```yaml
/// tiers:
///   free:
///     transfer: { window_ms: 60000, max: 5 }
/// ```
#[derive(Debug, Default, Deserialize)]
struct PolicyOverrides {
    #[serde(default)]
    tiers: HashMap<Tier, HashMap<EndpointClass, Limit>>,
}

/// Immutable mapping from `(tier, endpoint class)` to a [`Limit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    limits: HashMap<Tier, HashMap<EndpointClass, Limit>>,
}

impl PolicyTable {
    /// Load the built-in table with overrides from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy overrides");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load the built-in table with overrides from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: PolicyOverrides = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse policy overrides: {}", e)))?;

        let mut table = Self::default();
        for (tier, classes) in overrides.tiers {
            for (class, limit) in classes {
                if limit.window_ms == 0 {
                    return Err(GateError::Config(format!(
                        "window_ms must be positive for {}/{}",
                        tier, class
                    )));
                }
                table.limits.entry(tier).or_default().insert(class, limit);
            }
        }
        Ok(table)
    }

    /// Look up the limit for a tier and endpoint class.
    ///
    /// A class missing from a tier resolves to that tier's `general` limit.
    pub fn resolve(&self, tier: Tier, endpoint_class: EndpointClass) -> Limit {
        let classes = self
            .limits
            .get(&tier)
            .or_else(|| self.limits.get(&Tier::Free));

        classes
            .and_then(|c| {
                c.get(&endpoint_class)
                    .or_else(|| c.get(&EndpointClass::General))
            })
            .copied()
            .unwrap_or_else(|| default_limit(Tier::Free, EndpointClass::General))
    }

    /// Look up the limit from raw names, with the fallbacks of [`Tier::from_name`]
    /// and [`EndpointClass::from_name`].
    pub fn resolve_names(&self, tier: &str, endpoint_class: &str) -> Limit {
        self.resolve(Tier::from_name(tier), EndpointClass::from_name(endpoint_class))
    }

    /// Every entry, in tier then endpoint class order.
    pub fn entries(&self) -> Vec<(Tier, EndpointClass, Limit)> {
        Tier::ALL
            .iter()
            .flat_map(|&tier| {
                EndpointClass::ALL
                    .iter()
                    .map(move |&class| (tier, class, self.resolve(tier, class)))
            })
            .collect()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let limits = Tier::ALL
            .iter()
            .map(|&tier| {
                let classes = EndpointClass::ALL
                    .iter()
                    .map(|&class| (class, default_limit(tier, class)))
                    .collect();
                (tier, classes)
            })
            .collect();
        Self { limits }
    }
}

fn default_limit(tier: Tier, endpoint_class: EndpointClass) -> Limit {
    use EndpointClass as E;

    match (tier, endpoint_class) {
        (Tier::Free, E::General) => Limit::new(QUARTER_HOUR_MS, 100),
        (Tier::Free, E::Wallet) => Limit::new(QUARTER_HOUR_MS, 50),
        (Tier::Free, E::Premium) => Limit::new(QUARTER_HOUR_MS, 10),
        (Tier::Free, E::Transfer) => Limit::new(MINUTE_MS, 3),
        (Tier::Free, E::Auth) => Limit::new(QUARTER_HOUR_MS, 5),
        (Tier::Free, E::Search) => Limit::new(MINUTE_MS, 30),

        (Tier::Premium, E::General) => Limit::new(QUARTER_HOUR_MS, 300),
        (Tier::Premium, E::Wallet) => Limit::new(QUARTER_HOUR_MS, 150),
        (Tier::Premium, E::Premium) => Limit::new(QUARTER_HOUR_MS, 100),
        (Tier::Premium, E::Transfer) => Limit::new(MINUTE_MS, 10),
        (Tier::Premium, E::Auth) => Limit::new(QUARTER_HOUR_MS, 10),
        (Tier::Premium, E::Search) => Limit::new(MINUTE_MS, 100),

        (Tier::Admin, E::General) => Limit::new(QUARTER_HOUR_MS, 1000),
        (Tier::Admin, E::Wallet) => Limit::new(QUARTER_HOUR_MS, 500),
        (Tier::Admin, E::Premium) => Limit::new(QUARTER_HOUR_MS, 500),
        (Tier::Admin, E::Transfer) => Limit::new(MINUTE_MS, 50),
        (Tier::Admin, E::Auth) => Limit::new(QUARTER_HOUR_MS, 50),
        (Tier::Admin, E::Search) => Limit::new(MINUTE_MS, 300),
    }
}
