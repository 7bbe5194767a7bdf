// src/parser.rs
//! Line-at-a-time HTTP/1.1 request parsing over a [`ReadBuf`].
//!
//! Nothing here copies or mutates the received bytes: lines come back as
//! offset ranges, and only the parse cursors move.

use crate::buffer::ReadBuf;
use crate::http::{HttpCode, LineStatus, Method, Phase, Request};

/// Scan from `checked_idx` for the next `\r\n`.
///
/// On `Ok` the cursor sits just past the terminator and `start_line` has
/// moved to it. A lone `\r` at the end of the data is `Open`; the cursor
/// stays on it so the next call re-examines it with more bytes.
pub fn parse_line(rb: &mut ReadBuf) -> LineStatus {
    let mut idx = rb.checked_idx();
    while let Some(b) = rb.byte(idx) {
        match b {
            b'\r' => match rb.byte(idx + 1) {
                None => {
                    rb.set_checked(idx);
                    return LineStatus::Open;
                }
                Some(b'\n') => {
                    let line = rb.start_line()..idx;
                    rb.set_checked(idx + 2);
                    rb.mark_line_start();
                    return LineStatus::Ok(line);
                }
                Some(_) => return LineStatus::Bad,
            },
            b'\n' => {
                if idx > rb.start_line() && rb.byte(idx - 1) == Some(b'\r') {
                    let line = rb.start_line()..idx - 1;
                    rb.set_checked(idx + 1);
                    rb.mark_line_start();
                    return LineStatus::Ok(line);
                }
                return LineStatus::Bad;
            }
            _ => idx += 1,
        }
    }
    rb.set_checked(idx);
    LineStatus::Open
}

/// `METHOD SP URL SP HTTP/1.1`. On success fills `req`, moves to
/// [`Phase::Headers`] and returns `NoRequest` (keep reading).
pub fn parse_request_line(text: &str, req: &mut Request, phase: &mut Phase) -> HttpCode {
    let mut parts = text.split([' ', '\t']).filter(|s| !s.is_empty());
    let (Some(method), Some(url), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return HttpCode::BadRequest;
    };

    let Some(method) = Method::from_bytes(method.as_bytes()) else {
        return HttpCode::BadRequest;
    };
    if version != "HTTP/1.1" {
        return HttpCode::BadRequest;
    }
    let Some(path) = strip_absolute_form(url) else {
        return HttpCode::BadRequest;
    };
    if !path.starts_with('/') {
        return HttpCode::BadRequest;
    }

    req.method = Some(method);
    req.url.clear();
    req.url.push_str(path);
    req.version.clear();
    req.version.push_str(version);
    *phase = Phase::Headers;
    HttpCode::NoRequest
}

/// `http://host/path` -> `/path`. `None` when the absolute form has no path.
fn strip_absolute_form(url: &str) -> Option<&str> {
    for scheme in ["http://", "https://"] {
        let matches = url
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme));
        if matches {
            let rest = &url[scheme.len()..];
            return rest.find('/').map(|i| &rest[i..]);
        }
    }
    Some(url)
}

/// One header line. A blank line ends the header block: the request is
/// complete (`GetRequest`) unless a body was declared, in which case the
/// phase moves to [`Phase::Content`].
pub fn parse_header(text: &str, req: &mut Request, phase: &mut Phase) -> HttpCode {
    if text.is_empty() {
        if req.content_length > 0 {
            *phase = Phase::Content;
            return HttpCode::NoRequest;
        }
        return HttpCode::GetRequest;
    }

    let Some((name, value)) = text.split_once(':') else {
        return HttpCode::BadRequest;
    };
    let name = name.trim();
    let value = value.trim_matches([' ', '\t']);

    if name.eq_ignore_ascii_case("connection") {
        if value.eq_ignore_ascii_case("keep-alive") {
            req.keep_alive = true;
        } else if value.eq_ignore_ascii_case("close") {
            req.keep_alive = false;
        }
    } else if name.eq_ignore_ascii_case("content-length") {
        match value.parse::<usize>() {
            Ok(n) => req.content_length = n,
            Err(_) => return HttpCode::BadRequest,
        }
    } else if name.eq_ignore_ascii_case("host") {
        req.host = Some(value.to_string());
    } else {
        tracing::trace!(header = name, "ignoring header");
    }
    HttpCode::NoRequest
}

/// The body is complete once `content_length` bytes sit past the headers.
pub fn parse_content(rb: &mut ReadBuf, req: &mut Request) -> HttpCode {
    match rb.take(req.content_length) {
        Some(body) => {
            req.body = Some(body);
            HttpCode::GetRequest
        }
        None => HttpCode::NoRequest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(data: &[u8]) -> ReadBuf {
        let mut rb = ReadBuf::new();
        rb.extend(data);
        rb
    }

    #[test]
    fn test_parse_line_ok_and_open() {
        let mut rb = buf(b"GET / HTTP/1.1\r\nHost: a");
        assert_eq!(parse_line(&mut rb), LineStatus::Ok(0..14));
        assert_eq!(rb.checked_idx(), 16);
        assert_eq!(rb.start_line(), 16);

        assert_eq!(parse_line(&mut rb), LineStatus::Open);
        assert_eq!(rb.checked_idx(), rb.read_idx());
        assert_eq!(rb.start_line(), 16);

        rb.extend(b"\r\n");
        assert_eq!(parse_line(&mut rb), LineStatus::Ok(16..23));
        assert_eq!(rb.text(16..23), Some("Host: a"));
    }

    #[test]
    fn test_parse_line_split_terminator() {
        let mut rb = buf(b"abc\r");
        assert_eq!(parse_line(&mut rb), LineStatus::Open);
        assert_eq!(rb.checked_idx(), 3);
        rb.extend(b"\n");
        assert_eq!(parse_line(&mut rb), LineStatus::Ok(0..3));
    }

    #[test]
    fn test_parse_line_bad_terminators() {
        assert_eq!(parse_line(&mut buf(b"abc\rx")), LineStatus::Bad);
        assert_eq!(parse_line(&mut buf(b"abc\n")), LineStatus::Bad);
    }

    #[test]
    fn test_parse_line_keeps_bytes_intact() {
        let mut rb = buf(b"a\r\nb\r\n");
        assert_eq!(parse_line(&mut rb), LineStatus::Ok(0..1));
        assert_eq!(parse_line(&mut rb), LineStatus::Ok(3..4));
        assert_eq!(rb.filled(), b"a\r\nb\r\n");
    }

    #[test]
    fn test_parse_request_line() {
        let mut req = Request::default();
        let mut phase = Phase::RequestLine;
        assert_eq!(
            parse_request_line("GET /index.html HTTP/1.1", &mut req, &mut phase),
            HttpCode::NoRequest
        );
        assert_eq!(req.method, Some(Method::Get));
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(phase, Phase::Headers);
    }

    #[test]
    fn test_parse_request_line_absolute_form() {
        let mut req = Request::default();
        let mut phase = Phase::RequestLine;
        let code = parse_request_line("POST HTTP://example.com/a/b HTTP/1.1", &mut req, &mut phase);
        assert_eq!(code, HttpCode::NoRequest);
        assert_eq!(req.url, "/a/b");

        let code = parse_request_line("GET http://example.com HTTP/1.1", &mut req, &mut phase);
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn test_parse_request_line_rejects() {
        let cases = [
            "FOO / HTTP/1.1",
            "get / HTTP/1.1",
            "GET / HTTP/1.0",
            "GET index.html HTTP/1.1",
            "GET / HTTP/1.1 extra",
            "GET /",
            "",
        ];
        for line in cases {
            let mut req = Request::default();
            let mut phase = Phase::RequestLine;
            assert_eq!(
                parse_request_line(line, &mut req, &mut phase),
                HttpCode::BadRequest,
                "{line:?}"
            );
            assert_eq!(phase, Phase::RequestLine);
        }
    }

    #[test]
    fn test_parse_headers() {
        let mut req = Request::default();
        let mut phase = Phase::Headers;
        assert_eq!(parse_header("Host: localhost", &mut req, &mut phase), HttpCode::NoRequest);
        assert_eq!(parse_header("connection:Keep-Alive", &mut req, &mut phase), HttpCode::NoRequest);
        assert_eq!(parse_header("X-Custom: whatever", &mut req, &mut phase), HttpCode::NoRequest);
        assert_eq!(req.host.as_deref(), Some("localhost"));
        assert!(req.keep_alive);
        assert_eq!(parse_header("", &mut req, &mut phase), HttpCode::GetRequest);
        assert_eq!(phase, Phase::Headers);
    }

    #[test]
    fn test_parse_headers_with_body() {
        let mut req = Request::default();
        let mut phase = Phase::Headers;
        assert_eq!(parse_header("Content-Length: 5", &mut req, &mut phase), HttpCode::NoRequest);
        assert_eq!(req.content_length, 5);
        assert_eq!(parse_header("", &mut req, &mut phase), HttpCode::NoRequest);
        assert_eq!(phase, Phase::Content);
    }

    #[test]
    fn test_parse_headers_rejects_garbage() {
        let mut req = Request::default();
        let mut phase = Phase::Headers;
        assert_eq!(parse_header("Content-Length: -1", &mut req, &mut phase), HttpCode::BadRequest);
        assert_eq!(parse_header("no colon here", &mut req, &mut phase), HttpCode::BadRequest);
    }

    #[test]
    fn test_parse_content() {
        let mut rb = buf(b"abc");
        let mut req = Request {
            content_length: 5,
            ..Request::default()
        };
        assert_eq!(parse_content(&mut rb, &mut req), HttpCode::NoRequest);
        rb.extend(b"de");
        assert_eq!(parse_content(&mut rb, &mut req), HttpCode::GetRequest);
        assert_eq!(req.body, Some(0..5));
    }
}
