use std::net::IpAddr;

use thiserror::Error;
use url::{Url, form_urlencoded};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid url '{url}': {source}")]
    Parse {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme '{0}'")]
    Scheme(String),
    #[error("url '{0}' has no host")]
    MissingHost(String),
    #[error("malformed query string '{0}'")]
    Query(String),
    #[error("cannot derive a base domain from host '{0}'")]
    Domain(String),
}

/// The canonical cache identity of a URL, paired with the registrable
/// domain that selects its shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedKey {
    pub key: String,
    pub base_domain: String,
}

/// Canonicalizes `uri` into a stable cache key and derives its base domain.
///
/// URLs that differ only in redundant path separators, `.`/`..` segments, or
/// query-parameter ordering collapse to the same key. A trailing slash is
/// preserved so a directory-style URL keeps a distinct identity from its
/// non-trailing-slash form.
pub fn normalize_key(uri: &str) -> Result<NormalizedKey, KeyError> {
    let mut url = Url::parse(uri).map_err(|source| KeyError::Parse {
        url: uri.to_string(),
        source,
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(KeyError::Scheme(other.to_string())),
    }

    let host = url
        .host_str()
        .ok_or_else(|| KeyError::MissingHost(uri.to_string()))?
        .to_ascii_lowercase();
    let base_domain = base_domain_name(&host)?;

    let path = normalize_path(url.path());
    url.set_path(&path);

    match url.query() {
        None | Some("") => url.set_query(None),
        Some(query) => {
            let canonical = normalize_query(query)?;
            url.set_query(Some(&canonical));
        }
    }
    url.set_fragment(None);

    Ok(NormalizedKey {
        key: url.to_string(),
        base_domain,
    })
}

/// Derives the shard key for a host: literal IPs and `localhost` stand for
/// themselves, everything else reduces to its public-suffix registrable
/// domain.
pub fn base_domain_name(host: &str) -> Result<String, KeyError> {
    // Bracketed IPv6 literals arrive as `[::1]`.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return Ok(bare.to_string());
    }
    if host == "localhost" {
        return Ok(host.to_string());
    }
    psl::domain_str(host)
        .map(str::to_string)
        .ok_or_else(|| KeyError::Domain(host.to_string()))
}

fn normalize_path(path: &str) -> String {
    let trailing = path.ends_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(&stack.join("/"));
    if trailing && out.len() > 1 {
        out.push('/');
    }
    out
}

fn normalize_query(raw: &str) -> Result<String, KeyError> {
    validate_query(raw)?;

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();
    // Stable sort: repeated keys keep their original relative order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    Ok(serializer.finish())
}

fn validate_query(raw: &str) -> Result<(), KeyError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b';' => return Err(KeyError::Query(raw.to_string())),
            b'%' => {
                if bytes.len() < i + 3
                    || !bytes[i + 1].is_ascii_hexdigit()
                    || !bytes[i + 2].is_ascii_hexdigit()
                {
                    return Err(KeyError::Query(raw.to_string()));
                }
                i += 3;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}
