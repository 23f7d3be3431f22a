use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::url::{HttpTarget, UrlError};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_USER_AGENT: &str = "MppHTTPClient";
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024;

const ACCEPT_ENCODING: &str = "identity;q=1,chunked;q=0.1,*;q=0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "PUT" => Some(Self::Put),
            "POST" => Some(Self::Post),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            _ => None,
        }
    }
}

/// An outbound request, cloneable so a retry can be re-sent as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub target: HttpTarget,
    pub body: String,
    pub timeout_ms: u64,
    pub user_agent: String,
    pub reuse: bool,
    pub http10: bool,
    pub body_limit: usize,
    headers: Vec<(String, String)>,
    collect: Vec<String>,
}

impl HttpRequest {
    pub fn new(method: Method, target: HttpTarget) -> Self {
        Self {
            method,
            target,
            body: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            reuse: false,
            http10: false,
            body_limit: DEFAULT_BODY_LIMIT,
            headers: Vec::new(),
            collect: Vec::new(),
        }
    }

    pub fn from_url(method: Method, url: &str) -> Result<Self, UrlError> {
        Ok(Self::new(method, HttpTarget::parse(url)?))
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    /// Asks for keep-alive. A client that gets it keeps the connection for its next request
    /// to the same host and port.
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn use_http10(mut self) -> Self {
        self.http10 = true;
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn with_authorization(mut self, user: &str, password: &str) -> Self {
        self.target.authorization = Some(STANDARD.encode(format!("{user}:{password}")));
        self
    }

    /// Adds or replaces a header. Headers the client manages itself are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if is_managed_header(name) {
            return self;
        }
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Asks the client to keep the value of response header `name`.
    pub fn collect_header(mut self, name: &str) -> Self {
        if !self.collect.iter().any(|key| key.eq_ignore_ascii_case(name)) {
            self.collect.push(name.to_string());
        }
        self
    }

    pub fn collected_headers(&self) -> &[String] {
        &self.collect
    }

    /// Whether the response to this request can carry a body at all.
    pub fn expects_body(&self) -> bool {
        self.method != Method::Head
    }

    pub fn encode_head(&self) -> String {
        let mut head = format!(
            "{} {} HTTP/1.{}\r\n",
            self.method.as_str(),
            self.target.path,
            if self.http10 { 0 } else { 1 }
        );
        push_header(&mut head, "Host", &self.target.host_header());
        push_header(&mut head, "User-Agent", &self.user_agent);
        push_header(
            &mut head,
            "Connection",
            if self.reuse { "keep-alive" } else { "close" },
        );
        if !self.http10 {
            push_header(&mut head, "Accept-Encoding", ACCEPT_ENCODING);
        }
        if let Some(auth) = &self.target.authorization {
            push_header(&mut head, "Authorization", &format!("Basic {auth}"));
        }
        for (name, value) in &self.headers {
            let shadowed = self.target.authorization.is_some()
                && name.eq_ignore_ascii_case("Authorization");
            if !shadowed {
                push_header(&mut head, name, value);
            }
        }
        if !self.body.is_empty() {
            push_header(&mut head, "Content-Length", &self.body.len().to_string());
        }
        head.push_str("\r\n");
        head
    }
}

fn is_managed_header(name: &str) -> bool {
    ["Connection", "User-Agent", "Host", "Content-Length"]
        .iter()
        .any(|managed| managed.eq_ignore_ascii_case(name))
}

fn push_header(head: &mut String, name: &str, value: &str) {
    head.push_str(name);
    head.push_str(": ");
    head.push_str(value);
    head.push_str("\r\n");
}
