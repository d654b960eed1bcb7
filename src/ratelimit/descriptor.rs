//! Rate key generation.

/// Prefix shared by every key a window store holds.
pub const KEY_PREFIX: &str = "ratelimit:";

/// Class name used when the caller supplies a blank one.
const DEFAULT_CLASS: &str = "general";

/// A key that uniquely identifies one sliding window.
///
/// The key is composed of the endpoint class the caller asked for and the
/// caller identifier. Class names outside the policy table still get their
/// own window; only the limit lookup falls back to `general`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    /// Endpoint class name, trimmed and lowercased
    pub endpoint_class: String,
    /// User id or network address of the caller
    pub identifier: String,
}

impl RateKey {
    pub fn new(identifier: &str, endpoint_class: &str) -> Self {
        Self {
            endpoint_class: normalize_class(endpoint_class),
            identifier: identifier.to_string(),
        }
    }

    /// The storage form, `ratelimit:<endpoint class>:<identifier>`.
    pub fn to_string_key(&self) -> String {
        format!("{}{}:{}", KEY_PREFIX, self.endpoint_class, self.identifier)
    }
}

fn normalize_class(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        DEFAULT_CLASS.to_string()
    } else {
        name.to_ascii_lowercase()
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
