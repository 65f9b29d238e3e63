use std::time::Duration;

use chrono::DateTime;
use http::header::{HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, DATE, ETAG, LAST_MODIFIED};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WritersError};

/// Hop-by-hop headers that describe the connection rather than the resource.
const TRANSIENT_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Snapshot of a response's status and headers, as seen by a member when it joined the group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Set when this snapshot was restored from an entry stored as incomplete.
    pub was_truncated: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedResponse {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    truncated: bool,
}

impl ResponseInfo {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            was_truncated: false,
        }
    }

    /// Declared body length, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
    }

    /// False when the server declared `Accept-Ranges: none`.
    pub fn accepts_ranges(&self) -> bool {
        !self.headers.get_all(ACCEPT_RANGES).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("none")))
                .unwrap_or(false)
        })
    }

    /// A strong entity tag, or a `Last-Modified` sufficiently older than `Date` to be
    /// usable for conditional revalidation of a byte range.
    pub fn has_strong_validators(&self, min_age: Duration) -> bool {
        if let Some(etag) = self.headers.get(ETAG).and_then(|v| v.to_str().ok()) {
            let etag = etag.trim();
            if !etag.is_empty() && !etag.starts_with("W/") {
                return true;
            }
        }

        let parse_date = |name: HeaderName| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        };

        match (parse_date(LAST_MODIFIED), parse_date(DATE)) {
            (Some(last_modified), Some(date)) => {
                let age = date.signed_duration_since(last_modified);
                age.to_std().map(|age| age >= min_age).unwrap_or(false)
            },
            _ => false,
        }
    }

    /// Header-level preconditions for keeping an incomplete body: known positive length,
    /// ranges accepted, and a strong validator.
    pub fn allows_resume(&self, min_age: Duration) -> bool {
        matches!(self.content_length(), Some(len) if len > 0)
            && self.accepts_ranges()
            && self.has_strong_validators(min_age)
    }

    /// Serializes the snapshot as an entry metadata blob.
    pub fn persist(&self, truncated: bool, skip_transient_headers: bool) -> Result<Vec<u8>> {
        let headers = self
            .headers
            .iter()
            .filter(|(name, _)| !(skip_transient_headers && TRANSIENT_HEADERS.contains(&name.as_str())))
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        let persisted = PersistedResponse {
            status: self.status.as_u16(),
            headers,
            truncated,
        };
        Ok(bincode::serialize(&persisted)?)
    }

    /// Inverse of [`persist`](Self::persist).
    pub fn restore(blob: &[u8]) -> Result<Self> {
        let persisted: PersistedResponse = bincode::deserialize(blob)?;

        let status = StatusCode::from_u16(persisted.status)
            .map_err(|e| WritersError::Serialization(format!("bad status {}: {e}", persisted.status)))?;

        let mut headers = HeaderMap::with_capacity(persisted.headers.len());
        for (name, value) in persisted.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WritersError::Serialization(format!("bad header name {name:?}: {e}")))?;
            let value =
                HeaderValue::from_bytes(&value).map_err(|e| WritersError::Serialization(format!("bad header value: {e}")))?;
            headers.append(name, value);
        }

        Ok(Self {
            status,
            headers,
            was_truncated: persisted.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use http::header::CONNECTION;

    use super::*;

    const MIN_AGE: Duration = Duration::from_secs(60);

    fn info(headers: &[(&'static str, &'static str)]) -> ResponseInfo {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(*value));
        }
        ResponseInfo::new(StatusCode::OK, map)
    }

    #[test]
    fn test_content_length() {
        assert_eq!(info(&[("content-length", "1000")]).content_length(), Some(1000));
        assert_eq!(info(&[("content-length", "abc")]).content_length(), None);
        assert_eq!(info(&[]).content_length(), None);
    }

    #[test]
    fn test_accept_ranges_none() {
        assert!(info(&[]).accepts_ranges());
        assert!(info(&[("accept-ranges", "bytes")]).accepts_ranges());
        assert!(!info(&[("accept-ranges", "None")]).accepts_ranges());
    }

    #[test]
    fn test_strong_validators() {
        assert!(info(&[("etag", "\"abc\"")]).has_strong_validators(MIN_AGE));
        assert!(!info(&[("etag", "W/\"abc\"")]).has_strong_validators(MIN_AGE));

        let old = info(&[
            ("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("date", "Mon, 07 Nov 1994 08:49:37 GMT"),
        ]);
        assert!(old.has_strong_validators(MIN_AGE));

        let fresh = info(&[
            ("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("date", "Sun, 06 Nov 1994 08:49:57 GMT"),
        ]);
        assert!(!fresh.has_strong_validators(MIN_AGE));

        assert!(!info(&[("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT")]).has_strong_validators(MIN_AGE));
    }

    #[test]
    fn test_allows_resume() {
        assert!(info(&[("content-length", "10"), ("etag", "\"v1\"")]).allows_resume(MIN_AGE));
        assert!(!info(&[("content-length", "0"), ("etag", "\"v1\"")]).allows_resume(MIN_AGE));
        assert!(!info(&[("content-length", "10")]).allows_resume(MIN_AGE));
        assert!(!info(&[("content-length", "10"), ("etag", "\"v1\""), ("accept-ranges", "none")]).allows_resume(MIN_AGE));
    }

    #[test]
    fn test_persist_marks_truncated_and_strips_transient_headers() {
        let mut original = info(&[("content-length", "10"), ("etag", "\"v1\"")]);
        original.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let blob = original.persist(true, true).unwrap();
        let restored = ResponseInfo::restore(&blob).unwrap();

        assert!(restored.was_truncated);
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.content_length(), Some(10));
        assert!(restored.headers.get(CONNECTION).is_none());

        let kept = ResponseInfo::restore(&original.persist(false, false).unwrap()).unwrap();
        assert!(!kept.was_truncated);
        assert!(kept.headers.get(CONNECTION).is_some());
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(ResponseInfo::restore(b"\x01").is_err());
    }
}
