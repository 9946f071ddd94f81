use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors produced while checking a feed URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Only http and https feeds can be fetched.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The host is a private or link-local IP literal.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The host is localhost or a loopback literal.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Which hosts a feed URL may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPolicy {
    /// Reject localhost and private address literals (SSRF protection).
    #[default]
    PublicOnly,
    /// Accept any host. Used for intranet feeds and tests against local servers.
    AllowPrivate,
}

impl HostPolicy {
    pub fn from_allow_private(allow_private: bool) -> Self {
        if allow_private {
            Self::AllowPrivate
        } else {
            Self::PublicOnly
        }
    }
}

/// Parses a feed URL and applies the given [`HostPolicy`].
///
/// The scheme must be `http` or `https` regardless of policy. Under
/// [`HostPolicy::PublicOnly`] the host additionally may not be `localhost`,
/// a loopback address, or a private/link-local/unspecified IP literal.
///
/// Hostnames are not resolved; a public name that resolves to a private
/// address is accepted.
///
/// # Examples
///
/// ```
/// use feedmill::util::{validate_url, HostPolicy};
///
/// let url = validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://192.168.1.1/feed", HostPolicy::PublicOnly).is_err());
/// assert!(validate_url("http://192.168.1.1/feed", HostPolicy::AllowPrivate).is_ok());
/// assert!(validate_url("file:///etc/passwd", HostPolicy::AllowPrivate).is_err());
/// ```
pub fn validate_url(url_str: &str, policy: HostPolicy) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;

    if policy == HostPolicy::AllowPrivate {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::Localhost);
    }

    // IPv6 hosts come back bracketed from host_str()
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = bare.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_urls_accepted() {
        assert!(validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).is_ok());
        assert!(validate_url("http://news.example.org:8080/rss", HostPolicy::PublicOnly).is_ok());
    }

    #[test]
    fn test_surrounding_whitespace_ignored() {
        let url = validate_url("  https://example.com/feed  ", HostPolicy::PublicOnly).unwrap();
        assert_eq!(url.as_str(), "https://example.com/feed");
    }

    #[test]
    fn test_non_http_schemes_rejected_under_any_policy() {
        for policy in [HostPolicy::PublicOnly, HostPolicy::AllowPrivate] {
            assert!(matches!(
                validate_url("ftp://example.com/feed", policy),
                Err(UrlValidationError::UnsupportedScheme(_))
            ));
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            validate_url("not a url", HostPolicy::AllowPrivate),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_loopback_rejected_when_public_only() {
        for url in [
            "http://localhost/feed",
            "http://LOCALHOST:3000/feed",
            "http://127.0.0.1/feed",
            "http://[::1]/feed",
        ] {
            assert_eq!(
                validate_url(url, HostPolicy::PublicOnly),
                Err(UrlValidationError::Localhost),
                "{url}"
            );
        }
    }

    #[test]
    fn test_private_ranges_rejected_when_public_only() {
        for url in [
            "http://10.0.0.1/feed",
            "http://172.16.0.1/feed",
            "http://192.168.1.1:8080/feed",
            "http://169.254.1.1/feed",
            "http://0.0.0.0/feed",
            "http://[fe80::1]/feed",
            "http://[fd00::1]/feed",
        ] {
            assert!(
                matches!(
                    validate_url(url, HostPolicy::PublicOnly),
                    Err(UrlValidationError::PrivateIp(_))
                ),
                "{url}"
            );
        }
    }

    #[test]
    fn test_allow_private_accepts_local_servers() {
        assert!(validate_url("http://127.0.0.1:4567/feed", HostPolicy::AllowPrivate).is_ok());
        assert!(validate_url("http://localhost/feed", HostPolicy::AllowPrivate).is_ok());
    }
}
