use digestpipe_core::{Credential, Error, Result};
use reqwest::header::{HeaderMap, AUTHORIZATION};

const BEARER: &str = "bearer ";

/// Resolve the API key for one invocation.
///
/// `headers` must be the metadata of the request being served right now;
/// `fallback` is the process-wide secret loaded at startup.
pub fn resolve(headers: Option<&HeaderMap>, fallback: Option<&Credential>) -> Result<Credential> {
    let raw = match headers.and_then(|h| h.get(AUTHORIZATION)) {
        Some(v) => Some(
            v.to_str()
                .map_err(|_| Error::Auth("authorization header is not valid text".to_string()))?,
        ),
        None => None,
    };

    match raw.filter(|s| !s.is_empty()) {
        Some(value) => {
            let token = strip_bearer(value);
            if token.is_empty() {
                return Err(Error::Auth("authorization header carries no token".to_string()));
            }
            Ok(Credential::new(token))
        }
        None => fallback.cloned().ok_or_else(|| {
            Error::Auth("missing Authorization header and no fallback API key configured".to_string())
        }),
    }
}

fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim_start();
    match trimmed.get(..BEARER.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(BEARER) => trimmed[BEARER.len()..].trim(),
        _ => value.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn bearer_marker_and_whitespace_are_stripped() {
        let c = resolve(Some(&headers("Bearer sk-abc123")), None).unwrap();
        assert_eq!(c.expose(), "sk-abc123");

        let c = resolve(Some(&headers("bEaReR    sk-abc123  ")), None).unwrap();
        assert_eq!(c.expose(), "sk-abc123");
    }

    #[test]
    fn unprefixed_header_is_used_trimmed() {
        let c = resolve(Some(&headers("  sk-raw ")), None).unwrap();
        assert_eq!(c.expose(), "sk-raw");
        // "Bearer" without the separating space is not the scheme marker.
        let c = resolve(Some(&headers("Bearersk")), None).unwrap();
        assert_eq!(c.expose(), "Bearersk");
    }

    #[test]
    fn header_wins_over_fallback() {
        let fb = Credential::new("env-key");
        let c = resolve(Some(&headers("Bearer per-request")), Some(&fb)).unwrap();
        assert_eq!(c.expose(), "per-request");
    }

    #[test]
    fn missing_or_empty_header_uses_fallback() {
        let fb = Credential::new("env-key");
        assert_eq!(resolve(None, Some(&fb)).unwrap().expose(), "env-key");
        assert_eq!(
            resolve(Some(&HeaderMap::new()), Some(&fb)).unwrap().expose(),
            "env-key"
        );
        assert_eq!(
            resolve(Some(&headers("")), Some(&fb)).unwrap().expose(),
            "env-key"
        );
    }

    #[test]
    fn nothing_configured_is_auth_error() {
        let err = resolve(Some(&HeaderMap::new()), None).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(err.stage(), "auth");
    }

    #[test]
    fn marker_without_token_is_auth_error() {
        let err = resolve(Some(&headers("Bearer   ")), Some(&Credential::new("x"))).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn errors_do_not_echo_header_value() {
        let mut h = HeaderMap::new();
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_bytes(b"Bearer sk-\xff-secret").unwrap(),
        );
        let err = resolve(Some(&h), None).unwrap_err();
        assert!(!err.to_string().contains("secret"));
    }
}
