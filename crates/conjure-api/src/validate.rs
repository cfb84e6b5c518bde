//! Webhook URL validation
//!
//! User-supplied delivery URLs must be http(s); in production, loopback and
//! private-range hosts are refused so the dispatcher cannot be steered at
//! internal services.

/// Why a URL was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    Scheme,
    Malformed,
    ForbiddenHost,
}

impl std::fmt::Display for UrlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::Scheme => "webhook URL must use http or https",
            Self::Malformed => "webhook URL is malformed",
            Self::ForbiddenHost => "webhook URL host is not allowed",
        };
        write!(f, "{}", message)
    }
}

/// Validate a user-supplied webhook URL.
pub fn validate_webhook_url(url: &str, production: bool) -> Result<(), UrlError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or(UrlError::Scheme)?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    if authority.is_empty() {
        return Err(UrlError::Malformed);
    }
    // Strip userinfo and port
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host
        .strip_prefix('[')
        .map(|h| h.split(']').next().unwrap_or(h))
        .unwrap_or_else(|| host.split(':').next().unwrap_or(host));
    if host.is_empty() {
        return Err(UrlError::Malformed);
    }

    if production && is_internal_host(host) {
        return Err(UrlError::ForbiddenHost);
    }
    Ok(())
}

fn is_internal_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") || host == "::1" || host == "0.0.0.0" {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            std::net::IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemes() {
        assert!(validate_webhook_url("https://example.com/hook", true).is_ok());
        assert!(validate_webhook_url("http://example.com/hook", true).is_ok());
        assert_eq!(
            validate_webhook_url("ftp://example.com", true),
            Err(UrlError::Scheme)
        );
        assert_eq!(validate_webhook_url("example.com", true), Err(UrlError::Scheme));
    }

    #[test]
    fn test_loopback_refused_in_production() {
        for url in [
            "http://localhost:8080/hook",
            "http://127.0.0.1/hook",
            "https://10.0.0.5/hook",
            "https://192.168.1.1/hook",
            "http://[::1]/hook",
        ] {
            assert_eq!(
                validate_webhook_url(url, true),
                Err(UrlError::ForbiddenHost),
                "{} should be refused",
                url
            );
        }
    }

    #[test]
    fn test_loopback_allowed_in_development() {
        assert!(validate_webhook_url("http://localhost:8080/hook", false).is_ok());
        assert!(validate_webhook_url("http://127.0.0.1:9999/hook", false).is_ok());
    }

    #[test]
    fn test_malformed() {
        assert_eq!(validate_webhook_url("https://", true), Err(UrlError::Malformed));
        assert_eq!(validate_webhook_url("https:///path", true), Err(UrlError::Malformed));
    }

    #[test]
    fn test_host_with_port_and_path() {
        assert!(validate_webhook_url("https://hooks.example.com:8443/v1/a?b=c", true).is_ok());
    }
}
