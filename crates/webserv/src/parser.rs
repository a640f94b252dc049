// src/parser.rs
use crate::buffer::Buffer;
use crate::http::{Method, Request};
use memchr::memmem;

const CRLF: &[u8] = b"\r\n";

/// Longest request line or header line accepted.
pub const MAX_LINE: usize = 8 * 1024;
/// Most bytes a request line plus header block may take.
pub const MAX_HEAD: usize = 64 * 1024;

/// Bare page names that are served as `<name>.html`.
const DEFAULT_HTML: &[&str] = &["/index", "/register", "/login", "/welcome", "/video", "/picture"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The first line is not `METHOD SP PATH SP HTTP/VERSION`.
    InvalidRequestLine(String),
    /// A line ran past `MAX_LINE` without a CRLF.
    LineTooLong,
    /// The request line and headers together exceeded `MAX_HEAD`.
    HeadTooLarge,
}

/// Incremental request parser.
///
/// Consumes one CRLF-terminated line per step from the connection's input
/// buffer. Anything that is not yet a full line stays buffered, and the
/// parser keeps its state until the rest arrives, so a request split across
/// several reads resumes where it stopped.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
    request: Request,
    head_len: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Forget any partial request and start over at the request line.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.request = Request::default();
        self.head_len = 0;
    }

    /// Hand out the finished request and get ready for the next one.
    pub fn take_request(&mut self) -> Request {
        self.state = ParseState::RequestLine;
        self.head_len = 0;
        std::mem::take(&mut self.request)
    }

    /// Drive the state machine over whatever `buf` holds.
    ///
    /// Returns `Ok(true)` once the request is complete, `Ok(false)` if more
    /// bytes are needed.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<bool, ParseError> {
        while self.state != ParseState::Finish && buf.readable_bytes() > 0 {
            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = self.next_line(buf)? else {
                        break;
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    self.parse_request_line(&line)?;
                    buf.retrieve_until(end + 2);
                }
                ParseState::Headers => {
                    let Some(end) = self.next_line(buf)? else {
                        break;
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    buf.retrieve_until(end + 2);
                    if !self.parse_header(&line) {
                        // Separator line. A declared body that has not arrived
                        // yet is waited for; extra bytes after a GET are not.
                        let buffered = buf.readable_bytes() > 0;
                        self.state = if self.declared_length() > 0 || (buffered && self.expects_body()) {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    }
                }
                ParseState::Body => {
                    // Single-line body: up to the next CRLF, else everything buffered.
                    let readable = buf.peek();
                    let (len, consumed) = match memmem::find(readable, CRLF) {
                        Some(end) => (end, end + 2),
                        None => (readable.len(), readable.len()),
                    };
                    self.request.body = readable[..len].to_vec();
                    buf.retrieve_until(consumed);
                    self.parse_body();
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => break,
            }
        }

        if self.state == ParseState::Finish {
            tracing::debug!(
                method = %self.request.method,
                path = %self.request.path,
                version = %self.request.version,
                "request parsed"
            );
        }
        Ok(self.state == ParseState::Finish)
    }

    /// Offset of the CRLF ending the next head line, counting it against
    /// the head limits. `None` while the line is still incomplete.
    fn next_line(&mut self, buf: &Buffer) -> Result<Option<usize>, ParseError> {
        let Some(end) = memmem::find(buf.peek(), CRLF) else {
            if buf.readable_bytes() > MAX_LINE {
                return Err(ParseError::LineTooLong);
            }
            return Ok(None);
        };
        if end > MAX_LINE {
            return Err(ParseError::LineTooLong);
        }
        self.head_len += end + 2;
        if self.head_len > MAX_HEAD {
            return Err(ParseError::HeadTooLarge);
        }
        Ok(Some(end))
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidRequestLine(line.to_string()));
        };
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return Err(ParseError::InvalidRequestLine(line.to_string()));
        };

        self.request.method = Method::from_bytes(method.as_bytes());
        self.request.path = normalize_path(path);
        self.request.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    /// `NAME: VALUE` (the space after the colon is optional). Returns false
    /// for a line without a colon, which ends the header block.
    fn parse_header(&mut self, line: &str) -> bool {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.request.headers.insert(name.to_string(), value.to_string());
        true
    }

    /// Bytes after the header block belong to this request only for a POST
    /// or when a non-zero Content-Length says so; otherwise they are the
    /// start of the next request.
    fn expects_body(&self) -> bool {
        self.request.method == Method::Post || self.declared_length() > 0
    }

    fn declared_length(&self) -> u64 {
        self.request
            .header_ignore_case("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn parse_body(&mut self) {
        if !self.request.is_form_post() || self.request.body.is_empty() {
            return;
        }
        match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&self.request.body) {
            Ok(pairs) => {
                for (key, value) in pairs {
                    tracing::trace!(%key, "form field");
                    self.request.form.insert(key, value);
                }
            }
            Err(e) => tracing::debug!(error = %e, "undecodable form body"),
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path == "/" {
        "/index.html".to_string()
    } else if DEFAULT_HTML.contains(&path) {
        format!("{}.html", path)
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: &[u8]) -> Buffer {
        let mut b = Buffer::default();
        b.append(bytes);
        b
    }

    #[test]
    fn parses_minimal_get() {
        let mut buf = buffer(b"GET /index HTTP/1.1\r\n\r\n");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        assert_eq!(parser.state(), ParseState::Finish);

        let req = parser.request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.version, "1.1");
        assert!(req.body.is_empty());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn split_request_resumes_across_fills() {
        let mut buf = buffer(b"GET /index");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(false));
        assert_eq!(parser.state(), ParseState::RequestLine);
        assert_eq!(buf.peek(), b"GET /index");

        buf.append(b" HTTP/1.1\r\nHost: localhost\r\n");
        assert_eq!(parser.parse(&mut buf), Ok(false));
        assert_eq!(parser.state(), ParseState::Headers);

        buf.append(b"\r\n");
        assert_eq!(parser.parse(&mut buf), Ok(true));
        let req = parser.take_request();
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.header("Host"), Some("localhost"));
        assert_eq!(parser.state(), ParseState::RequestLine);
    }

    #[test]
    fn root_and_bare_names_are_normalized() {
        assert_eq!(normalize_path("/"), "/index.html");
        assert_eq!(normalize_path("/login"), "/login.html");
        assert_eq!(normalize_path("/picture"), "/picture.html");
        assert_eq!(normalize_path("/images/a.png"), "/images/a.png");
        assert_eq!(normalize_path("/unknown"), "/unknown");
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        for bad in [
            &b"GARBAGE\r\n\r\n"[..],
            b"GET /index FTP/1.1\r\n\r\n",
            b"GET  /index HTTP/1.1\r\n\r\n",
            b"GET /index HTTP/1.1 extra\r\n\r\n",
        ] {
            let mut buf = buffer(bad);
            let mut parser = RequestParser::new();
            assert!(
                matches!(parser.parse(&mut buf), Err(ParseError::InvalidRequestLine(_))),
                "accepted {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn headers_are_case_preserving_and_last_write_wins() {
        let mut buf = buffer(b"GET / HTTP/1.1\r\nX-Token:a\r\nX-Token: b\r\nx-token: c\r\n\r\n");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        let req = parser.request();
        assert_eq!(req.header("X-Token"), Some("b"));
        assert_eq!(req.header("x-token"), Some("c"));
    }

    #[test]
    fn form_body_is_decoded() {
        let mut buf = buffer(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 36\r\n\r\nusername=j%C3%B6rg+k&password=a%26b%3D",
        );
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        let req = parser.request();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/login.html");
        assert_eq!(req.form_value("username"), Some("jörg k"));
        assert_eq!(req.form_value("password"), Some("a&b="));
    }

    #[test]
    fn body_of_non_form_post_is_kept_raw() {
        let mut buf = buffer(b"POST /api HTTP/1.1\r\nContent-Type: text/plain\r\n\r\na=b");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        assert_eq!(parser.request().body, b"a=b");
        assert!(parser.request().form.is_empty());
    }

    #[test]
    fn body_waits_for_bytes_after_separator() {
        let mut buf = buffer(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 21\r\n\r\n",
        );
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(false));
        assert_eq!(parser.state(), ParseState::Body);

        buf.append(b"username=a&password=b");
        assert_eq!(parser.parse(&mut buf), Ok(true));
        let req = parser.take_request();
        assert_eq!(req.form_value("username"), Some("a"));
        assert_eq!(req.form_value("password"), Some("b"));
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn post_without_length_finishes_at_separator() {
        let mut buf = buffer(b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        assert!(parser.request().body.is_empty());
    }

    #[test]
    fn short_body_is_taken_as_sent() {
        let mut buf = buffer(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 29\r\n\r\nusername=a&password=b",
        );
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        assert_eq!(parser.request().form_value("password"), Some("b"));
    }

    #[test]
    fn overlong_lines_are_rejected() {
        let mut buf = buffer(&[b'A'; MAX_LINE + 1]);
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Err(ParseError::LineTooLong));

        let mut buf = buffer(b"GET / HTTP/1.1\r\nX-Big: ");
        buf.append(&[b'b'; MAX_LINE]);
        buf.append(b"\r\n\r\n");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Err(ParseError::LineTooLong));
    }

    #[test]
    fn endless_header_block_is_rejected() {
        let mut buf = buffer(b"GET / HTTP/1.1\r\n");
        let mut parser = RequestParser::new();
        let mut result = Ok(false);
        for i in 0..(MAX_HEAD / 16 + 1) {
            buf.append(format!("X-H{:05}: 0123\r\n", i).as_bytes());
            result = parser.parse(&mut buf);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(ParseError::HeadTooLarge));
    }

    #[test]
    fn bytes_after_a_get_stay_buffered() {
        let mut buf = buffer(b"GET /index HTTP/1.1\r\n\r\nGET /login HTTP/1.1\r\n\r\n");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(true));
        let first = parser.take_request();
        assert_eq!(first.path, "/index.html");
        assert!(first.body.is_empty());

        assert_eq!(parser.parse(&mut buf), Ok(true));
        assert_eq!(parser.take_request().path, "/login.html");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut buf = buffer(b"GET /a HTTP/1.1\r\nHost: x\r\n");
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Ok(false));
        parser.reset();
        assert_eq!(parser.state(), ParseState::RequestLine);
        assert!(parser.request().headers.is_empty());
    }
}
