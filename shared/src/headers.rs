// Header rewriting applied whenever a message crosses this node on its way to or
// from a peer: hop-by-hop headers are connection-scoped and must not be relayed,
// and every hop records itself in the Via header.

use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};

const VIA_PSEUDONYM: &str = "shardgate";

static HOP_BY_HOP: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

/// Strips hop-by-hop headers and appends our Via entry.
pub fn prepare_forwarded(headers: &mut HeaderMap, version: Version) {
    strip_hop_by_hop(headers, version);
    append_via(headers, version);
}

fn via_protocol(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}

pub fn append_via(headers: &mut HeaderMap, version: Version) {
    let Some(protocol) = via_protocol(version) else {
        tracing::debug!(?version, "unknown HTTP version, not adding Via");
        return;
    };

    let entry = format!("{protocol} {VIA_PSEUDONYM}");
    let value = match headers.get(VIA).map(|v| v.to_str()) {
        Some(Ok(existing)) => format!("{existing}, {entry}"),
        // An unreadable Via is left alone rather than clobbered
        Some(Err(_)) => return,
        None => entry,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// HTTP/2 and HTTP/3 have no hop-by-hop headers, so only HTTP/1.x is filtered.
/// Besides the standard set, anything named in `Connection` is dropped, and
/// `keep-alive` for HTTP/1.0 and older.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, version: Version) {
    let legacy = match version {
        Version::HTTP_09 | Version::HTTP_10 => true,
        Version::HTTP_11 => false,
        _ => return,
    };

    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }

    if legacy {
        headers.remove(HeaderName::from_static("keep-alive"));
    }
}
