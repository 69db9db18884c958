//! Mapping request hosts to application names

use crate::app::entry_exists;
use crate::config::AppSettings;
use std::net::{IpAddr, Ipv4Addr};

/// Wildcard DNS services that embed an IPv4 address in the host name
const WILDCARD_DNS_SUFFIXES: &[&str] = &[".xip.io", ".nip.io", ".sslip.io"];

/// Resolve a request host to the name of an application under the host root.
///
/// Labels are stripped from the left until a candidate exists, so
/// `assets.blog.test` tries `assets.blog` then `blog`. The last label is the
/// top-level domain and is never a candidate on its own. Falls back to
/// `settings.default_app` when nothing matches.
pub fn application_name_for(host: &str, settings: &AppSettings) -> String {
    candidates(host)
        .into_iter()
        .find(|candidate| entry_exists(candidate, settings))
        .unwrap_or_else(|| settings.default_app.clone())
}

/// Candidate application names for `host`, most specific first
pub fn candidates(host: &str) -> Vec<String> {
    let host = normalize(host);
    if host.is_empty() || is_ip_literal(&host) {
        return Vec::new();
    }

    let (labels, keep_last) = match strip_wildcard_dns(&host) {
        Some(prefix) => (prefix.split('.').collect::<Vec<_>>(), true),
        None => (host.split('.').collect::<Vec<_>>(), false),
    };
    if labels.iter().any(|label| label.is_empty()) {
        return Vec::new();
    }

    let end = if keep_last {
        labels.len()
    } else {
        labels.len().saturating_sub(1)
    };
    (0..end).map(|start| labels[start..end].join(".")).collect()
}

fn normalize(host: &str) -> String {
    strip_port(host.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Host part of a `Host` header value: `blog.test:8080` -> `blog.test`,
/// `[::1]:8080` -> `::1`. Bare IPv6 literals are returned unchanged.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(bracketed) = host.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// `blog.10.0.0.1.xip.io` -> `blog`
fn strip_wildcard_dns(host: &str) -> Option<&str> {
    let without_service = WILDCARD_DNS_SUFFIXES
        .iter()
        .find_map(|suffix| host.strip_suffix(suffix))?;

    let labels: Vec<&str> = without_service.split('.').collect();
    if labels.len() < 4 {
        return None;
    }
    let ip = labels[labels.len() - 4..].join(".");
    ip.parse::<Ipv4Addr>().ok()?;

    let prefix_len = labels[..labels.len() - 4].join(".").len();
    Some(&without_service[..prefix_len])
}
