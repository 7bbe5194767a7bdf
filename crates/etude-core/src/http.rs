// src/http.rs
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
}

impl Method {
    /// Closed set: anything else is not a method this server speaks.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"TRACE" => Some(Method::Trace),
            b"OPTIONS" => Some(Method::Options),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of parsing and realising a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Incomplete: wait for more bytes.
    NoRequest,
    /// A complete, well-formed request; not yet resolved against the document root.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
    ClosedConnection,
}

impl HttpCode {
    /// Status code and reason phrase for outcomes that produce a response.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            HttpCode::FileRequest => Some((200, "OK")),
            HttpCode::BadRequest => Some((400, "Bad Request")),
            HttpCode::ForbiddenRequest => Some((403, "Forbidden")),
            HttpCode::NoResource => Some((404, "Not Found")),
            HttpCode::InternalError => Some((500, "Internal Error")),
            HttpCode::NoRequest | HttpCode::GetRequest | HttpCode::ClosedConnection => None,
        }
    }

    /// Inline HTML body for error outcomes.
    pub fn error_page(&self) -> Option<&'static str> {
        match self {
            HttpCode::BadRequest => Some(
                "<html><body><h1>400 Bad Request</h1><p>Your request has bad syntax or is inherently impossible to satisfy.</p></body></html>\n",
            ),
            HttpCode::ForbiddenRequest => Some(
                "<html><body><h1>403 Forbidden</h1><p>You do not have permission to get this file from this server.</p></body></html>\n",
            ),
            HttpCode::NoResource => Some(
                "<html><body><h1>404 Not Found</h1><p>The requested file was not found on this server.</p></body></html>\n",
            ),
            HttpCode::InternalError => Some(
                "<html><body><h1>500 Internal Error</h1><p>There was an unusual problem serving the requested file.</p></body></html>\n",
            ),
            _ => None,
        }
    }
}

/// Which part of the request the parser expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    RequestLine,
    Headers,
    Content,
}

/// Result of scanning for the next `\r\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete line; the range excludes the terminator.
    Ok(Range<usize>),
    Bad,
    Open,
}

/// What the dispatcher should wait for next on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Read,
    Write,
    Close,
}

/// Accumulated request record.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Option<Method>,
    /// Path component with any absolute-form `http://host` prefix removed.
    pub url: String,
    pub version: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
    /// Body bytes, as a range into the connection's read buffer.
    pub body: Option<Range<usize>>,
}

impl Request {
    pub fn clear(&mut self) {
        self.method = None;
        self.url.clear();
        self.version.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
        self.body = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_table() {
        assert_eq!(Method::from_bytes(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_bytes(b"CONNECT"), Some(Method::Connect));
        assert_eq!(Method::from_bytes(b"get"), None);
        assert_eq!(Method::from_bytes(b"PATCH"), None);
        assert_eq!(Method::Options.to_string(), "OPTIONS");
    }

    #[test]
    fn test_only_final_outcomes_have_status() {
        assert_eq!(HttpCode::FileRequest.status(), Some((200, "OK")));
        assert_eq!(HttpCode::NoResource.status(), Some((404, "Not Found")));
        assert!(HttpCode::NoRequest.status().is_none());
        assert!(HttpCode::FileRequest.error_page().is_none());
        assert!(HttpCode::BadRequest.error_page().unwrap().contains("400"));
    }
}
