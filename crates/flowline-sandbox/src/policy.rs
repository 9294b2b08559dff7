//! Network and secret policies applied before connector execution.

use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// JSON keys treated as outbound destinations during scans.
const URL_KEYS: [&str; 4] = ["url", "endpoint", "base_url", "api_url"];

// ── Network policy ───────────────────────────────────────────────────

/// Host-level egress policy.
///
/// Evaluation order per URL: block-list, then the localhost/private
/// toggles, then the allow-list. With no allow-list configured the
/// default is allow; an empty-but-present allow-list permits nothing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Host patterns that are always refused. Supports `*` wildcards
    /// per label position, e.g. `*.internal.example.com`, `10.*.*.*`.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// When set, only hosts matching one of these patterns are
    /// permitted.
    #[serde(default)]
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub allow_localhost: bool,
    #[serde(default)]
    pub allow_private_network: bool,
}

impl NetworkPolicy {
    /// Permissive policy used when a workflow has no egress
    /// restrictions configured.
    pub fn allow_all() -> Self {
        Self {
            allow_localhost: true,
            allow_private_network: true,
            ..Self::default()
        }
    }

    pub fn with_blocked_host(mut self, pattern: impl Into<String>) -> Self {
        self.blocked_hosts.push(pattern.into());
        self
    }

    pub fn with_allowed_host(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_hosts
            .get_or_insert_with(Vec::new)
            .push(pattern.into());
        self
    }

    /// Check a single URL against the policy.
    pub fn check_url(&self, url: &str) -> SandboxResult<()> {
        let host = extract_host(url).ok_or_else(|| {
            SandboxError::network_violation(format!("cannot determine host of '{url}'"))
        })?;

        if self
            .blocked_hosts
            .iter()
            .any(|pattern| host_matches(pattern, &host))
        {
            return Err(SandboxError::network_violation(format!(
                "host '{host}' is on the block list"
            )));
        }

        if !self.allow_localhost && is_localhost(&host) {
            return Err(SandboxError::network_violation(format!(
                "host '{host}' resolves to localhost"
            )));
        }

        if !self.allow_private_network && is_private_address(&host) {
            return Err(SandboxError::network_violation(format!(
                "host '{host}' is a private network address"
            )));
        }

        if let Some(allowed) = &self.allowed_hosts {
            if !allowed.iter().any(|pattern| host_matches(pattern, &host)) {
                return Err(SandboxError::network_violation(format!(
                    "host '{host}' is not on the allow list"
                )));
            }
        }

        Ok(())
    }

    /// Walk a JSON object and check every URL-bearing field. Runs over
    /// step config and inputs before the connector executes.
    pub fn scan_object(&self, map: &flowline_types::JsonObject) -> SandboxResult<()> {
        for (key, entry) in map {
            if let Value::String(url) = entry {
                if URL_KEYS.contains(&key.as_str()) {
                    self.check_url(url)?;
                }
            }
            self.scan_value(entry)?;
        }
        Ok(())
    }

    /// Recursive form of [`NetworkPolicy::scan_object`] for nested
    /// values.
    pub fn scan_value(&self, value: &Value) -> SandboxResult<()> {
        match value {
            Value::Object(map) => self.scan_object(map),
            Value::Array(items) => {
                for item in items {
                    self.scan_value(item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Pull the host out of a URL without a full parser. Handles scheme,
/// userinfo, port and bracketed IPv6 literals.
fn extract_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);

    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next()?
    } else {
        authority.split(':').next()?
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Label-wise wildcard match: `*` matches exactly one dot-separated
/// label, so `10.*.*.*` covers the 10.0.0.0/8 range and
/// `*.example.com` covers direct subdomains.
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if !pattern.contains('*') {
        return pattern == host;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();
    if pattern_labels.len() != host_labels.len() {
        return false;
    }

    pattern_labels
        .iter()
        .zip(&host_labels)
        .all(|(p, h)| *p == "*" || p == h)
}

fn is_localhost(host: &str) -> bool {
    host == "localhost" || host == "::1" || host == "0.0.0.0" || host.starts_with("127.")
}

fn is_private_address(host: &str) -> bool {
    if host.starts_with("10.") || host.starts_with("192.168.") || host.starts_with("169.254.") {
        return true;
    }
    // 172.16.0.0/12
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next() {
            if let Ok(octet) = second.parse::<u8>() {
                return (16..=31).contains(&octet);
            }
        }
    }
    false
}

// ── Secret policy ────────────────────────────────────────────────────

/// Restricts which credential references a step may use.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecretPolicy {
    /// When set, only these credential ids may be referenced. Absent
    /// means all credentials the tenant owns are permitted.
    #[serde(default)]
    pub allowed_credentials: Option<HashSet<String>>,
}

impl SecretPolicy {
    pub fn allowing(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed_credentials: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn check_credential(&self, credential_id: &str) -> SandboxResult<()> {
        match &self.allowed_credentials {
            Some(allowed) if !allowed.contains(credential_id) => Err(
                SandboxError::secret_violation(format!(
                    "credential '{credential_id}' is not permitted for this step"
                )),
            ),
            _ => Ok(()),
        }
    }
}

/// Mask a secret value for logging. Short values are fully masked so
/// their length leaks nothing useful; longer values keep the first and
/// last two characters as a recognition aid.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
}
