use std::net::IpAddr;

use crate::{http::Method, parameters::Parameters};

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";

/// An inbound request as the runtime hands it to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: Parameters,
    pub body: String,
    pub remote: Option<IpAddr>,
    pub authorization: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            params: Parameters::new(),
            body: String::new(),
            remote: None,
            authorization: None,
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.params = Parameters::parse(query);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn from_remote(mut self, remote: IpAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_authorization(mut self, authorization: &str) -> Self {
        self.authorization = Some(authorization.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl Response {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn json(body: String) -> Self {
        Self {
            content_type: Some(APPLICATION_JSON),
            body,
            ..Self::status(200)
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            content_type: Some(TEXT_PLAIN),
            body: body.into(),
            ..Self::status(status)
        }
    }

    pub fn unauthorized() -> Self {
        Self::status(401).with_header("WWW-Authenticate", r#"Basic realm="Login Required""#)
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where an inbound path leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Discovery,
    MissingAction,
    State(&'a str),
    Name(&'a str),
    Subscribe,
    Restart,
    Defaults,
    Survey,
    Version,
    Setup,
    DeviceAction { action: &'a str, udn: &'a str },
}

impl<'a> Route<'a> {
    /// Management actions win over device actions of the same name, except that `state`
    /// is only a management read for GET.
    pub fn resolve(method: Method, path: &'a str) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if trimmed.is_empty() {
            return Self::Discovery;
        }
        let (action, resource) = split_path(trimmed);
        match action {
            "" => Self::MissingAction,
            "state" if method == Method::Get => Self::State(resource),
            "name" => Self::Name(resource),
            "subscribe" => Self::Subscribe,
            "restart" => Self::Restart,
            "defaults" => Self::Defaults,
            "survey" => Self::Survey,
            "version" | "check" => Self::Version,
            "setup" => Self::Setup,
            action => Self::DeviceAction {
                action,
                udn: resource,
            },
        }
    }
}

/// `action/resource` split on the first `/`; the resource may be empty.
pub fn split_path(path: &str) -> (&str, &str) {
    path.split_once('/').unwrap_or((path, ""))
}
