// src/conn.rs
use crate::auth::CredentialValidator;
use crate::buffer::Buffer;
use crate::config::TriggerMode;
use crate::http::Request;
use crate::metrics::ServerMetrics;
use crate::parser::RequestParser;
use crate::resource::MappedFile;
use crate::response::HttpResponse;
use crate::syscalls;
use arrayvec::ArrayVec;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

/// A level-triggered write keeps going past one `writev` while more than
/// this many bytes are still queued.
const LT_WRITE_CONTINUE: usize = 10240;

/// Read-only state every connection handler sees.
pub struct SharedContext {
    pub root: PathBuf,
    pub trigger: TriggerMode,
    pub validator: Arc<dyn CredentialValidator>,
    pub metrics: Arc<ServerMetrics>,
}

/// What the reactor should do with a connection once a job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait for more request bytes.
    Read,
    /// Output is still queued; wait for write readiness.
    Write,
    Close,
}

/// Pending output: header bytes first, then an optional mapped file body.
/// The two spans retire independently, so the mapping lives until its last
/// byte is on the wire, however the header buffer is compacted.
#[derive(Debug, Default)]
pub struct WriteCursor {
    head: Buffer,
    file: Option<MappedFile>,
    file_pos: usize,
}

impl WriteCursor {
    pub fn head_mut(&mut self) -> &mut Buffer {
        &mut self.head
    }

    /// Attach the body for the response just written into the head buffer.
    /// Replacing a previous mapping unmaps it.
    pub fn set_file(&mut self, file: Option<MappedFile>) {
        self.file = file;
        self.file_pos = 0;
    }

    pub fn remaining(&self) -> usize {
        let file_left = self.file.as_ref().map_or(0, |f| f.len() - self.file_pos);
        self.head.readable_bytes() + file_left
    }

    pub fn spans(&self) -> ArrayVec<&[u8], 2> {
        let mut spans = ArrayVec::new();
        if self.head.readable_bytes() > 0 {
            spans.push(self.head.peek());
        }
        if let Some(file) = &self.file
            && self.file_pos < file.len()
        {
            spans.push(&file.as_slice()[self.file_pos..]);
        }
        spans
    }

    /// Retire `n` written bytes, head first.
    pub fn advance(&mut self, n: usize) {
        let from_head = n.min(self.head.readable_bytes());
        self.head.retrieve(from_head);
        if let Some(file) = &self.file {
            self.file_pos = (self.file_pos + n - from_head).min(file.len());
        }
    }

    /// Drop everything queued and release the mapping.
    pub fn clear(&mut self) {
        self.head.retrieve_all();
        self.set_file(None);
    }
}

/// One client socket and everything needed to serve it.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    addr: SocketAddr,
    input: Buffer,
    output: WriteCursor,
    parser: RequestParser,
    keep_alive: bool,
    peer_closed: bool,
    closed: bool,
    requests_served: u32,
}

impl Connection {
    pub fn new(fd: RawFd, addr: SocketAddr) -> Self {
        Self {
            fd,
            addr,
            input: Buffer::default(),
            output: WriteCursor::default(),
            parser: RequestParser::new(),
            keep_alive: false,
            peer_closed: false,
            closed: false,
            requests_served: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn to_write_bytes(&self) -> usize {
        self.output.remaining()
    }

    /// Pull bytes off the socket into the input buffer.
    ///
    /// Edge-triggered mode drains until the socket would block; level mode
    /// reads once. `Ok(0)` means the peer closed without sending anything
    /// new. `Err(WouldBlock)` means nothing was pending at all.
    pub fn read(&mut self, mode: TriggerMode) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.input.read_fd(self.fd) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !mode.is_edge() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Flush queued output with vectored writes.
    ///
    /// Edge-triggered mode writes until done or blocked; level mode stops
    /// after a call once little enough is left. Partial progress is kept.
    pub fn write(&mut self, mode: TriggerMode) -> io::Result<usize> {
        let mut total = 0;
        while self.output.remaining() > 0 {
            let n = match syscalls::writev(self.fd, &self.output.spans()) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            };
            self.output.advance(n);
            total += n;
            if !mode.is_edge() && self.output.remaining() <= LT_WRITE_CONTINUE {
                break;
            }
        }
        Ok(total)
    }

    /// Parse what has arrived and, once a request is complete, queue its
    /// response. Returns false when there is nothing to send yet.
    pub fn process(&mut self, ctx: &SharedContext) -> bool {
        if self.input.readable_bytes() == 0 {
            return false;
        }

        let mut response = match self.parser.parse(&mut self.input) {
            Ok(false) => return false,
            Ok(true) => {
                let mut request = self.parser.take_request();
                route_credentials(&mut request, ctx.validator.as_ref());
                self.keep_alive = request.is_keep_alive() && !self.peer_closed;
                tracing::debug!(
                    fd = self.fd,
                    method = %request.method,
                    path = %request.path,
                    keep_alive = self.keep_alive,
                    "request"
                );
                HttpResponse::new(&ctx.root, &request.path, self.keep_alive, None)
            }
            Err(e) => {
                tracing::warn!(fd = self.fd, peer = %self.addr, error = ?e, "bad request");
                self.parser.reset();
                self.input.retrieve_all();
                self.keep_alive = false;
                HttpResponse::new(&ctx.root, "", false, Some(400))
            }
        };

        response.make(self.output.head_mut());
        self.output.set_file(response.take_file());
        self.requests_served += 1;
        ctx.metrics.inc_req();
        tracing::debug!(
            fd = self.fd,
            code = response.code(),
            bytes = self.output.remaining(),
            "response queued"
        );
        true
    }

    /// Worker entry after new input: process, then try to send right away.
    pub fn on_process(&mut self, ctx: &SharedContext) -> Next {
        if !self.process(ctx) {
            return Next::Read;
        }
        self.on_write(ctx)
    }

    /// Worker entry on write readiness.
    pub fn on_write(&mut self, ctx: &SharedContext) -> Next {
        loop {
            let res = self.write(ctx.trigger);
            if let Ok(n) = res {
                ctx.metrics.add_bytes(n);
            }

            if self.output.remaining() == 0 {
                self.output.set_file(None);
                if !self.keep_alive {
                    return Next::Close;
                }
                // Another request may already be buffered.
                if !self.process(ctx) {
                    return Next::Read;
                }
                continue;
            }

            return match res {
                Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                    tracing::debug!(fd = self.fd, error = %e, "write failed");
                    Next::Close
                }
                _ => Next::Write,
            };
        }
    }

    /// Release the mapping and the descriptor. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.output.clear();
        syscalls::close_fd(self.fd);
        tracing::debug!(fd = self.fd, peer = %self.addr, served = self.requests_served, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Login and registration forms land on the welcome page when the
/// credentials check out and on the error page otherwise.
fn route_credentials(request: &mut Request, validator: &dyn CredentialValidator) {
    if !request.is_form_post() {
        return;
    }
    let is_login = match request.path.as_str() {
        "/login.html" => true,
        "/register.html" => false,
        _ => return,
    };
    let user = request.form_value("username").unwrap_or_default();
    let password = request.form_value("password").unwrap_or_default();
    let ok = validator.verify(user, password, is_login);
    request.path = if ok { "/welcome.html" } else { "/error.html" }.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;

    /// A connected socket pair: the server side as a raw non-blocking fd,
    /// the client side as a regular stream.
    fn socket_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        (Connection::new(server.into_raw_fd(), peer), client)
    }

    fn context(root: &std::path::Path) -> SharedContext {
        SharedContext {
            root: root.to_path_buf(),
            trigger: TriggerMode::Edge,
            validator: Arc::new(|u: &str, p: &str, _login: bool| u == "a" && p == "b"),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    fn site() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), b"<p>home</p>").unwrap();
        fs::write(root.path().join("welcome.html"), b"<p>welcome</p>").unwrap();
        fs::write(root.path().join("error.html"), b"<p>error</p>").unwrap();
        root
    }

    fn read_response(client: &mut TcpStream, body_len: usize) -> String {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed early");
            out.extend_from_slice(&chunk[..n]);
            if let Some(pos) = out.windows(4).position(|w| w == b"\r\n\r\n")
                && out.len() >= pos + 4 + body_len
            {
                break;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn cursor_retires_head_then_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("body.txt");
        fs::write(&path, b"0123456789").unwrap();

        let mut cursor = WriteCursor::default();
        cursor.head_mut().append(b"HEAD");
        cursor.set_file(Some(MappedFile::open(&path).unwrap()));
        assert_eq!(cursor.remaining(), 14);
        assert_eq!(cursor.spans().len(), 2);

        cursor.advance(6);
        let spans = cursor.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], b"23456789");
        drop(spans);

        cursor.advance(8);
        assert_eq!(cursor.remaining(), 0);
        assert!(cursor.spans().is_empty());
    }

    #[test]
    fn serves_file_and_keeps_alive() {
        let root = site();
        let ctx = context(root.path());
        let (mut conn, mut client) = socket_pair();

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(conn.read(TriggerMode::Edge).unwrap() > 0);
        assert_eq!(conn.on_process(&ctx), Next::Read);
        assert!(conn.is_keep_alive());

        let res = read_response(&mut client, 11);
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(res.contains("Connection: keep-alive\r\n"));
        assert!(res.ends_with("<p>home</p>"));
        assert_eq!(conn.requests_served(), 1);
        assert!(ctx.metrics.snapshot().bytes_sent >= res.len());
    }

    #[test]
    fn stale_wakeup_is_a_no_op() {
        let root = site();
        let ctx = context(root.path());
        let (mut conn, _client) = socket_pair();
        assert!(!conn.process(&ctx));
        assert_eq!(conn.on_process(&ctx), Next::Read);
        assert_eq!(
            conn.read(TriggerMode::Level).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn login_form_routes_by_credentials() {
        let root = site();
        let ctx = context(root.path());
        for (body, expected) in [
            ("username=a&password=b", "<p>welcome</p>"),
            ("username=a&password=x", "<p>error</p>"),
        ] {
            let (mut conn, mut client) = socket_pair();
            let req = format!(
                "POST /login HTTP/1.1\r\nConnection: keep-alive\r\n\
                 Content-Type: application/x-www-form-urlencoded\r\n\
                 Content-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            client.write_all(req.as_bytes()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
            conn.read(TriggerMode::Edge).unwrap();
            assert_eq!(conn.on_process(&ctx), Next::Read);
            let res = read_response(&mut client, expected.len());
            assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{}", res);
            assert!(res.contains("Connection: keep-alive\r\n"));
            assert!(res.ends_with(expected), "{}", res);
        }
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let root = site();
        let ctx = context(root.path());
        let (mut conn, mut client) = socket_pair();
        client.write_all(b"NONSENSE\r\n\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.read(TriggerMode::Edge).unwrap();
        assert_eq!(conn.on_process(&ctx), Next::Close);

        let mut res = String::new();
        conn.close();
        client.read_to_string(&mut res).unwrap();
        assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(res.contains("Connection: close\r\n"));
    }

    #[test]
    fn unterminated_line_is_cut_off_with_400() {
        let root = site();
        let ctx = context(root.path());
        let (mut conn, mut client) = socket_pair();
        let flood = vec![b'x'; crate::parser::MAX_LINE + 1024];
        client.write_all(&flood).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.read(TriggerMode::Edge).unwrap();
        assert_eq!(conn.on_process(&ctx), Next::Close);
        assert!(!conn.is_keep_alive());

        conn.close();
        let mut res = Vec::new();
        client.read_to_end(&mut res).unwrap();
        assert!(res.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut conn, _client) = socket_pair();
        conn.close();
        assert!(conn.is_closed());
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn routing_ignores_other_paths() {
        let mut req = Request {
            method: crate::http::Method::Post,
            path: "/other.html".into(),
            ..Default::default()
        };
        req.headers
            .insert("Content-Type".into(), crate::http::FORM_URLENCODED.into());
        let reject_all = |_: &str, _: &str, _: bool| false;
        route_credentials(&mut req, &reject_all);
        assert_eq!(req.path, "/other.html");

        req.path = "/register.html".into();
        route_credentials(&mut req, &reject_all);
        assert_eq!(req.path, "/error.html");
    }
}
