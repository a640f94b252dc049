use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    #[default]
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// A fully parsed request. Header names keep the case they arrived with;
/// a repeated header overwrites the earlier value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    /// Protocol version without the `HTTP/` prefix, e.g. `1.1`.
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Decoded fields of a URL-encoded form body.
    pub form: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Header lookup ignoring ASCII case, for names clients spell differently.
    pub fn header_ignore_case(&self, name: &str) -> Option<&str> {
        self.header(name).or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn is_form_post(&self) -> bool {
        self.method == Method::Post
            && self
                .header_ignore_case("Content-Type")
                .is_some_and(|ct| ct.trim() == FORM_URLENCODED)
    }

    /// Keep-alive only when explicitly requested over HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header_ignore_case("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }
}

pub fn status_reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}
