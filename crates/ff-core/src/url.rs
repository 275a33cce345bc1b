//! Host extraction and domain normalization
//!
//! Lookups work directly on string slices and never allocate until the host
//! is normalized. Only `http` and `https` URLs have a host here: `chrome://`,
//! `about:`, `file://` and friends are never evaluated.

use crate::types::SchemeMask;

const WWW_PREFIX: &str = "www.";

// =============================================================================
// Scheme Extraction
// =============================================================================

/// Fast scheme extraction without URL parsing.
/// Returns the scheme mask or None if the scheme is not a web scheme.
#[inline]
pub fn extract_scheme(url: &str) -> Option<SchemeMask> {
    let bytes = url.as_bytes();
    if bytes.len() >= 8 && bytes[..8].eq_ignore_ascii_case(b"https://") {
        Some(SchemeMask::HTTPS)
    } else if bytes.len() >= 7 && bytes[..7].eq_ignore_ascii_case(b"http://") {
        Some(SchemeMask::HTTP)
    } else {
        None
    }
}

/// Get the position after "://".
#[inline]
pub fn get_scheme_end(url: &str) -> Option<usize> {
    let bytes = url.as_bytes();
    let colon_pos = bytes.iter().position(|&b| b == b':')?;

    if bytes.len() > colon_pos + 2 && bytes[colon_pos + 1] == b'/' && bytes[colon_pos + 2] == b'/' {
        return Some(colon_pos + 3);
    }

    None
}

// =============================================================================
// Host Extraction
// =============================================================================

/// Get the start and end positions of the hostname in a URL.
/// Userinfo and port are excluded; IPv6 literals keep their brackets.
pub fn get_host_position(url: &str) -> Option<(usize, usize)> {
    let scheme_end = get_scheme_end(url)?;
    let bytes = url.as_bytes();

    let authority_end = bytes[scheme_end..]
        .iter()
        .position(|&b| matches!(b, b'/' | b'?' | b'#' | b'\\'))
        .map_or(bytes.len(), |i| scheme_end + i);

    // Skip userinfo
    let host_start = bytes[scheme_end..authority_end]
        .iter()
        .rposition(|&b| b == b'@')
        .map_or(scheme_end, |i| scheme_end + i + 1);

    if bytes.get(host_start) == Some(&b'[') {
        let close = bytes[host_start..authority_end].iter().position(|&b| b == b']')?;
        return Some((host_start, host_start + close + 1));
    }

    let host_end = bytes[host_start..authority_end]
        .iter()
        .position(|&b| b == b':')
        .map_or(authority_end, |i| host_start + i);

    Some((host_start, host_end))
}

/// Host of an `http(s)` URL as a slice into the original string.
/// Returns None for other schemes and for URLs without a host.
#[inline]
pub fn extract_host(url: &str) -> Option<&str> {
    if !SchemeMask::WEB.intersects(extract_scheme(url)?) {
        return None;
    }
    let (start, end) = get_host_position(url)?;
    if start == end {
        return None;
    }
    Some(&url[start..end])
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize a hostname for lookup: lowercase, one trailing dot removed, and a
/// single literal leading `www.` stripped. Other subdomains are kept, so
/// `m.youtube.com` stays distinct from `youtube.com`.
pub fn normalize_host(host: &str) -> String {
    let host = host.strip_suffix('.').unwrap_or(host);
    let lower = host.to_ascii_lowercase();
    match lower.strip_prefix(WWW_PREFIX) {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Normalize a user-entered domain. Accepts a bare host, `host/path`, or a
/// full URL and keeps only the normalized host.
pub fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let rest = match trimmed.find("://") {
        Some(pos) => &trimmed[pos + 3..],
        None => trimmed,
    };
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = if host.starts_with('[') {
        host
    } else {
        host.split(':').next().unwrap_or(host)
    };

    if host.chars().any(char::is_whitespace) {
        return None;
    }

    let host = normalize_host(host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
