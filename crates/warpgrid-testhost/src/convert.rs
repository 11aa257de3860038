//! Projection of client request messages onto [`HttpContext`].
//!
//! Converts the client-facing `http::Request` into the server-side request
//! view: scheme, host, path base, decoded path, query, protocol, headers
//! and the content framing headers.

use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::{Parts, PathAndQuery};
use http::{HeaderMap, HeaderValue, Request, Uri};
use percent_encoding::percent_decode_str;
use warpgrid_exchange::{Error, HttpContext, Result};

use crate::content::RequestBody;

/// Resolve `target` against `base`.
///
/// Absolute URIs are taken as is. A rooted path (`/items`) replaces the
/// base path; any other relative path is joined onto the base directory, so
/// `items` against `http://localhost/api/` is `http://localhost/api/items`.
pub fn resolve_uri(base: &Uri, target: &str) -> Result<Uri> {
    if target.contains("://") {
        return Ok(target.parse()?);
    }
    let joined = if target.starts_with('/') {
        target.to_string()
    } else {
        let base_path = base.path();
        let dir = match base_path.rfind('/') {
            Some(i) => &base_path[..=i],
            None => "/",
        };
        format!("{dir}{target}")
    };

    let mut parts = Parts::default();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    parts.path_and_query = Some(joined.parse::<PathAndQuery>()?);
    Uri::from_parts(parts).map_err(|e| Error::InvalidUri(e.to_string()))
}

/// Resolve a request URI, which may be in origin form, against `base`.
pub(crate) fn absolute_uri(base: &Uri, uri: &Uri) -> Result<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let target = uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/");
    resolve_uri(base, target)
}

/// Split `path` into `(path_base, remainder)` when it lies under `path_base`.
///
/// Matching is per segment and ASCII case-insensitive: `/api` matches
/// `/api` and `/API/items`, never `/apix`. The remainder is `/` when the
/// path equals the base. A path outside the base yields an empty base.
pub fn split_path_base<'a>(path_base: &str, path: &'a str) -> (&'a str, &'a str) {
    let base = path_base.trim_end_matches('/');
    if base.is_empty() || path.len() < base.len() {
        return ("", path);
    }
    let (head, tail) = path.split_at(base.len());
    if !head.eq_ignore_ascii_case(base) {
        return ("", path);
    }
    if tail.is_empty() {
        (head, "/")
    } else if tail.starts_with('/') {
        (head, tail)
    } else {
        ("", path)
    }
}

/// Percent-decode a request path, keeping encoded slashes (`%2F`) intact so
/// they are not confused with segment separators.
pub fn decode_path(raw: &str) -> String {
    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = find_encoded_slash(rest) {
        decoded.push_str(&percent_decode_str(&rest[..pos]).decode_utf8_lossy());
        decoded.push_str(&rest[pos..pos + 3]);
        rest = &rest[pos + 3..];
    }
    decoded.push_str(&percent_decode_str(rest).decode_utf8_lossy());
    if decoded.is_empty() {
        decoded.push('/');
    }
    decoded
}

fn find_encoded_slash(s: &str) -> Option<usize> {
    s.as_bytes()
        .windows(3)
        .position(|w| w[0] == b'%' && w[1] == b'2' && (w[2] == b'F' || w[2] == b'f'))
}

/// Populate `context` from the client `request`, already resolved to the
/// absolute `uri`.
pub(crate) fn apply_request(
    context: &mut HttpContext,
    request: &Request<RequestBody>,
    uri: &Uri,
    path_base: &str,
) -> Result<()> {
    let target = context.request_mut();
    target.set_method(request.method().clone());
    target.set_protocol(request.version());
    target.set_scheme(uri.scheme_str().unwrap_or("http"));

    let (base, path) = split_path_base(path_base, uri.path());
    if !base.is_empty() {
        target.set_path_base(decode_path(base));
    }
    target.set_path(decode_path(path));
    target.set_query_string(uri.query().map(|q| format!("?{q}")).unwrap_or_default());

    let headers = target.headers_mut();
    copy_headers(request.headers(), headers);

    let host = match headers.get(HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => host.to_string(),
        None => {
            let authority = uri.authority().map(|a| a.as_str()).unwrap_or("localhost");
            headers.insert(HOST, HeaderValue::from_str(authority)?);
            authority.to_string()
        }
    };

    if let Some(content) = request.body().content() {
        copy_headers(content.headers(), headers);
        match content.content_length() {
            Some(len) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
            None => {
                headers.remove(CONTENT_LENGTH);
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
        }
    }

    target.set_host(host);
    Ok(())
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    let mut last = None;
    for (name, value) in from {
        // The first value of each name replaces, later ones append.
        if last.as_ref() != Some(name) {
            to.insert(name.clone(), value.clone());
            last = Some(name.clone());
        } else {
            to.append(name.clone(), value.clone());
        }
    }
}
