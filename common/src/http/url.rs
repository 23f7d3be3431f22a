use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("invalid url: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("unsupported scheme `{0}`, only http is available")]
    UnsupportedScheme(String),
    #[error("url has no host")]
    MissingHost,
}

/// Where a request goes: host, port, path with query, and optional Basic credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Base64 of `user:password`.
    pub authorization: Option<String>,
}

impl HttpTarget {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            host: host.to_string(),
            port,
            path,
            authorization: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, UrlError> {
        let url = Url::parse(text.trim())?;
        if url.scheme() != "http" {
            return Err(UrlError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url.host_str().ok_or(UrlError::MissingHost)?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut target = Self::new(host, port, url.path());
        if let Some(query) = url.query() {
            target.path.push('?');
            target.path.push_str(query);
        }
        if !url.username().is_empty() {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
            target.authorization = Some(STANDARD.encode(credentials));
        }
        Ok(target)
    }

    /// Value of the `Host` header; the port is omitted when it is 80 or 443.
    pub fn host_header(&self) -> String {
        match self.port {
            80 | 443 => self.host.clone(),
            port => format!("{}:{port}", self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_host_port_and_path() {
        let target = HttpTarget::parse("http://10.0.0.5:4030/events/doorbell?x=1").unwrap();
        assert_eq!(
            target,
            HttpTarget {
                host: "10.0.0.5".to_string(),
                port: 4030,
                path: "/events/doorbell?x=1".to_string(),
                authorization: None,
            }
        );
        assert_eq!(target.host_header(), "10.0.0.5:4030");
    }

    #[test]
    fn default_port_and_root_path() {
        let target = HttpTarget::parse("http://hub.local").unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/");
        assert_eq!(target.host_header(), "hub.local");
    }

    #[test]
    fn credentials_become_basic_auth() {
        let target = HttpTarget::parse("http://admin:pw@hub.local/x").unwrap();
        assert_eq!(target.authorization.as_deref(), Some("YWRtaW46cHc="));
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert_eq!(
            HttpTarget::parse("https://hub.local/"),
            Err(UrlError::UnsupportedScheme("https".to_string()))
        );
        assert!(matches!(
            HttpTarget::parse("not a url"),
            Err(UrlError::Invalid(_))
        ));
    }
}
