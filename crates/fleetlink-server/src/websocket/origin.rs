//! Browser origin screening for WebSocket upgrades.

use tracing::warn;

/// Decides which `Origin` headers may upgrade.
///
/// Requests without an `Origin` header are always accepted: native
/// device clients do not send one. Browser origins are normalized and
/// matched as case-insensitive suffixes against the allowed list, so an
/// entry like `.example.com` admits every subdomain without admitting
/// `evil-example.com`.
#[derive(Clone, Debug, Default)]
pub struct OriginPolicy {
    allowed_suffixes: Vec<String>,
}

impl OriginPolicy {
    /// Build a policy from configured suffixes (lowercased once here).
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed_suffixes: allowed.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Whether a request carrying `origin` (if any) may upgrade.
    pub fn permits(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let normalized = normalize(origin);
        let allowed = self
            .allowed_suffixes
            .iter()
            .any(|suffix| normalized.ends_with(suffix.as_str()));
        if !allowed {
            warn!(origin, "origin rejected");
        }
        allowed
    }
}

/// Lowercase and strip the scheme's default port, so
/// `https://Device.Example.com:443` and `https://device.example.com`
/// compare equal.
fn normalize(origin: &str) -> String {
    let mut normalized = origin.to_lowercase();
    let default_port = if normalized.starts_with("https://") {
        ":443"
    } else {
        ":80"
    };
    if let Some(stripped) = normalized.strip_suffix(default_port) {
        normalized = stripped.to_owned();
    }
    normalized
}
