//! Header ↔ call metadata forwarding.

use axum::http::HeaderMap;
use tonic::metadata::MetadataMap;

/// Headers that belong to the transport on one side or the other and are
/// never copied across, whatever the allow-list says.
const RESERVED: &[&str] = &[
    "connection",
    "content-length",
    "content-type",
    "grpc-accept-encoding",
    "grpc-encoding",
    "grpc-message",
    "grpc-status",
    "grpc-status-details-bin",
    "grpc-timeout",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "user-agent",
];

/// Allow-list of header name prefixes, matched case-insensitively.
#[derive(Clone, Debug)]
pub struct HeaderForwarding {
    prefixes: Vec<String>,
}

impl HeaderForwarding {
    pub fn new(prefixes: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        !RESERVED.contains(&name.as_str()) && self.prefixes.iter().any(|p| name.starts_with(p))
    }

    /// Inbound HTTP headers that become call metadata.
    pub fn to_metadata(&self, headers: &HeaderMap) -> MetadataMap {
        MetadataMap::from_headers(self.filter(headers))
    }

    /// Response metadata (headers and trailers) that becomes HTTP headers.
    pub fn to_headers(&self, metadata: &MetadataMap) -> HeaderMap {
        self.filter(&metadata.clone().into_headers())
    }

    fn filter(&self, headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in headers {
            if self.allows(name.as_str()) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn forwarding() -> HeaderForwarding {
        HeaderForwarding::new(["Authorization", "x-", "grpc-metadata-"])
    }

    #[test]
    fn test_prefix_match_is_case_insensitive() {
        let f = forwarding();
        assert!(f.allows("authorization"));
        assert!(f.allows("X-Request-Id"));
        assert!(f.allows("grpc-metadata-tenant"));
        assert!(!f.allows("cookie"));
        assert!(!f.allows("accept"));
    }

    #[test]
    fn test_reserved_headers_never_forwarded() {
        let f = HeaderForwarding::new(["content-", "grpc-", "te"]);
        assert!(!f.allows("content-type"));
        assert!(!f.allows("grpc-timeout"));
        assert!(!f.allows("grpc-status"));
        assert!(!f.allows("te"));
        assert!(f.allows("content-language"));
    }

    #[test]
    fn test_to_metadata_keeps_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        headers.insert("cookie", HeaderValue::from_static("secret"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        let metadata = forwarding().to_metadata(&headers);
        let tags: Vec<_> = metadata
            .get_all("x-tag")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert!(metadata.get("cookie").is_none());
        assert_eq!(metadata.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_to_headers_filters_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-request-id", "42".parse().unwrap());
        metadata.insert("server-timing", "db;dur=3".parse().unwrap());

        let headers = forwarding().to_headers(&metadata);
        assert_eq!(headers.get("x-request-id").unwrap(), "42");
        assert!(headers.get("server-timing").is_none());
    }

    #[test]
    fn test_empty_prefixes_forward_nothing() {
        let f = HeaderForwarding::new(Vec::<String>::new());
        assert!(!f.allows("x-anything"));
    }
}
