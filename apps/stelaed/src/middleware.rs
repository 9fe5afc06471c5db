use axum::http::HeaderMap;
use subtle::ConstantTimeEq as _;

pub const INTERNAL_HEADER: &str = "x-proxy-internal";

/// Per-mount authorization.
///
/// The facade's in-process re-entry carries `X-Proxy-Internal` set to the
/// per-process token and bypasses the bearer check. Any other value of that
/// header is rejected outright, even on mounts with no tokens configured, so
/// an external caller cannot use the header to slip past auth.
pub fn authorize(headers: &HeaderMap, auth_tokens: &[String], internal_token: &str) -> bool {
    if let Some(presented) = headers.get(INTERNAL_HEADER) {
        return presented
            .as_bytes()
            .ct_eq(internal_token.as_bytes())
            .into();
    }

    if auth_tokens.is_empty() {
        return true;
    }

    let Some(bearer) = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        return false;
    };

    auth_tokens
        .iter()
        .any(|token| bool::from(bearer.as_bytes().ct_eq(token.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).expect("header name"),
                HeaderValue::from_str(value).expect("header value"),
            );
        }
        headers
    }

    #[test]
    fn open_mount_allows_anonymous() {
        assert!(authorize(&HeaderMap::new(), &[], "proc-token"));
    }

    #[test]
    fn bearer_token_is_checked_against_allowlist() {
        let tokens = vec!["secret".to_string()];
        assert!(authorize(
            &headers_with(&[("authorization", "Bearer secret")]),
            &tokens,
            "proc-token",
        ));
        assert!(!authorize(
            &headers_with(&[("authorization", "Bearer wrong")]),
            &tokens,
            "proc-token",
        ));
        assert!(!authorize(&HeaderMap::new(), &tokens, "proc-token"));
    }

    #[test]
    fn internal_token_bypasses_bearer_check() {
        let tokens = vec!["secret".to_string()];
        assert!(authorize(
            &headers_with(&[(INTERNAL_HEADER, "proc-token")]),
            &tokens,
            "proc-token",
        ));
    }

    #[test]
    fn forged_internal_header_is_rejected_even_on_open_mounts() {
        assert!(!authorize(
            &headers_with(&[(INTERNAL_HEADER, "1")]),
            &[],
            "proc-token",
        ));
        assert!(!authorize(
            &headers_with(&[
                (INTERNAL_HEADER, "1"),
                ("authorization", "Bearer secret"),
            ]),
            &["secret".to_string()],
            "proc-token",
        ));
    }
}
