use http::{HeaderMap, HeaderName};

/// Skip certificate validation for this fetch only.
pub const HEADER_SSL: &str = "x-cache-ssl";
/// Reject pattern applied to freshly fetched content; repeatable.
pub const HEADER_REJECT: &str = "x-cache-reject";
/// Invalidate the target domain's cached entries instead of serving.
pub const HEADER_FLUSH: &str = "x-cache-flush";

pub fn insecure_requested(headers: &HeaderMap) -> bool {
    headers
        .get(HEADER_SSL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "INSECURE")
}

pub fn flush_requested(headers: &HeaderMap) -> bool {
    headers
        .get(HEADER_FLUSH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "TRUE")
}

/// All reject patterns supplied on the request, in header order.
pub fn reject_patterns(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(HEADER_REJECT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Copies the inbound header set onto the outbound request, dropping
/// hop-by-hop headers, the proxy's own control plane, and the inbound
/// `Accept-Encoding` (the outbound client negotiates encoding itself).
pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        if should_forward(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn should_forward(name: &HeaderName) -> bool {
    match name.as_str() {
        "accept-encoding" => false,
        "host" | "connection" | "proxy-connection" | "keep-alive" | "te" | "trailer"
        | "transfer-encoding" | "upgrade" | "content-length" => false,
        other => !other.starts_with("x-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn forwards_ordinary_headers() {
        let inbound = headers(&[
            ("user-agent", "scraper/1.0"),
            ("accept", "text/html"),
            ("cookie", "session=abc"),
        ]);
        let out = outbound_headers(&inbound);
        assert_eq!(out.get("user-agent").unwrap(), "scraper/1.0");
        assert_eq!(out.get("accept").unwrap(), "text/html");
        assert_eq!(out.get("cookie").unwrap(), "session=abc");
    }

    #[test]
    fn strips_control_plane_and_encoding_headers() {
        let inbound = headers(&[
            ("accept-encoding", "gzip"),
            ("host", "example.com"),
            ("connection", "keep-alive"),
            ("x-cache-reject", "some pattern"),
            ("x-cache-ssl", "INSECURE"),
            ("x-custom", "anything"),
        ]);
        let out = outbound_headers(&inbound);
        assert!(out.is_empty());
    }

    #[test]
    fn reads_repeated_reject_patterns_in_order() {
        let inbound = headers(&[
            ("x-cache-reject", "first"),
            ("x-cache-reject", "second"),
        ]);
        assert_eq!(reject_patterns(&inbound), vec!["first", "second"]);
    }

    #[test]
    fn control_header_values_are_exact() {
        assert!(insecure_requested(&headers(&[("x-cache-ssl", "INSECURE")])));
        assert!(!insecure_requested(&headers(&[("x-cache-ssl", "insecure")])));
        assert!(flush_requested(&headers(&[("x-cache-flush", "TRUE")])));
        assert!(!flush_requested(&headers(&[("x-cache-flush", "yes")])));
    }
}
