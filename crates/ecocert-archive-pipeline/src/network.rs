//! URL policy applied before any request leaves the process.
//!
//! Hosts are checked by pattern: loopback, RFC 1918, link-local, unique-local
//! and IPv4-mapped forms of those are refused unless the operator has put the
//! host on the allowlist.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::ContentError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlPolicy {
    /// Refuse plain http (production mode or explicit opt-in)
    pub https_only: bool,
    /// Hosts that bypass the private-address check, exact or `*.suffix`
    pub allowed_hosts: Vec<String>,
}

impl UrlPolicy {
    #[must_use]
    pub fn https_only(mut self, https_only: bool) -> Self {
        self.https_only = https_only;
        self
    }

    #[must_use]
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }
}

/// Parse `raw` and apply `policy`.
///
/// # Errors
/// Returns `INVALID_URL`, `INVALID_PROTOCOL`, `HTTPS_REQUIRED` or
/// `PRIVATE_ADDRESS_BLOCKED`.
pub fn validate_url(raw: &str, policy: &UrlPolicy) -> Result<Url, ContentError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ContentError::InvalidUrl(format!("{raw}: {err}")))?;

    match url.scheme() {
        "https" => {}
        "http" if policy.https_only => return Err(ContentError::HttpsRequired(url.to_string())),
        "http" => {}
        other => return Err(ContentError::InvalidProtocol(other.to_string())),
    }

    let host = url
        .host()
        .ok_or_else(|| ContentError::InvalidUrl(format!("{raw}: missing host")))?;
    let host_name = url
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']');

    if is_host_allowed(host_name, &policy.allowed_hosts) {
        return Ok(url);
    }

    if let Some(reason) = blocked_reason(&host) {
        return Err(ContentError::PrivateAddressBlocked {
            host: host_name.to_string(),
            reason: reason.to_string(),
        });
    }

    Ok(url)
}

fn is_host_allowed(host: &str, allowlist: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allowlist
        .iter()
        .map(|pattern| pattern.trim().to_ascii_lowercase())
        .any(|pattern| match pattern.strip_prefix("*.") {
            Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
            None => host == pattern,
        })
}

fn blocked_reason(host: &Host<&str>) -> Option<&'static str> {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            (domain == "localhost" || domain.ends_with(".localhost"))
                .then_some("loopback hostname")
        }
        Host::Ipv4(ip) => ipv4_reason(*ip),
        Host::Ipv6(ip) => ipv6_reason(*ip),
    }
}

fn ipv4_reason(ip: Ipv4Addr) -> Option<&'static str> {
    let [a, b, ..] = ip.octets();
    if a == 127 {
        Some("loopback address")
    } else if a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168) {
        Some("private address")
    } else if a == 169 && b == 254 {
        Some("link-local address")
    } else if a == 0 {
        Some("unspecified address")
    } else {
        None
    }
}

fn ipv6_reason(ip: Ipv6Addr) -> Option<&'static str> {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return ipv4_reason(mapped);
    }
    let first = ip.segments()[0];
    if ip.is_loopback() {
        Some("loopback address")
    } else if ip.is_unspecified() {
        Some("unspecified address")
    } else if first & 0xfe00 == 0xfc00 {
        Some("unique-local address")
    } else if first & 0xffc0 == 0xfe80 {
        Some("link-local address")
    } else {
        None
    }
}
