//! URL classification used by config resolution and the transports.
//!
//! Classification never fails and never rewrites a URL that already starts
//! absolute, malformed or not.

/// `./x`, `../x`, `/x` and `//host/x` are declared relative to the page, not to a prefix.
#[must_use]
pub fn is_relative_marked(url: &str) -> bool {
    url.starts_with("./") || url.starts_with("../") || url.starts_with('/')
}

/// Whether `url` is absolute: `http://`, `https://` (any case) or protocol-relative `//`.
///
/// Anything else, including `order:create`, is a bare path. A URL that starts
/// like an absolute one stays absolute even when it does not parse, so that
/// prefixing never corrupts it.
#[must_use]
pub fn is_absolute(url: &str) -> bool {
    if url.starts_with("//") {
        return true;
    }
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
    })
}

/// Whether `url` is a bare path that receives the configured prefix.
#[must_use]
pub fn needs_prefix(url: &str) -> bool {
    !(is_relative_marked(url) || is_absolute(url))
}

/// Prefix a bare path; absolute and relative-marked URLs are returned unchanged.
#[must_use]
pub fn with_prefix(prefix: &str, url: &str) -> String {
    if needs_prefix(url) {
        format!("{prefix}{url}")
    } else {
        url.to_owned()
    }
}

/// `.jsonp` path convention: `x.jsonp`, `x.jsonp?q`, `x.jsonp#f`.
#[must_use]
pub fn is_jsonp_url(url: &str) -> bool {
    url.split(['?', '#'])
        .next()
        .is_some_and(|path| path.ends_with(".jsonp"))
}

/// Append an encoded query string, keeping any fragment at the end.
#[must_use]
pub fn append_query(url: &str, query: &str) -> String {
    if query.is_empty() {
        return url.to_owned();
    }
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') {
        if base.ends_with('?') || base.ends_with('&') {
            ""
        } else {
            "&"
        }
    } else {
        "?"
    };
    match fragment {
        Some(fragment) => format!("{base}{separator}{query}#{fragment}"),
        None => format!("{base}{separator}{query}"),
    }
}
