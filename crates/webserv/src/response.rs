// src/response.rs
use crate::buffer::Buffer;
use crate::http::status_reason;
use crate::resource::{self, MappedFile, Resource};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const SUFFIX_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/msword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// MIME type by file suffix, `text/plain` when unknown.
pub fn content_type(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else {
        return "text/plain";
    };
    let suffix = &path[dot..];
    SUFFIX_TYPES
        .iter()
        .find(|(s, _)| *s == suffix)
        .map(|(_, t)| *t)
        .unwrap_or("text/plain")
}

/// Builds one response into a connection's output buffer.
///
/// Headers and any generated body go into the buffer; a static file body is
/// mapped and handed out separately through [`take_file`](Self::take_file)
/// so it can be written straight from the mapping.
#[derive(Debug)]
pub struct HttpResponse {
    root: PathBuf,
    path: String,
    keep_alive: bool,
    /// `None` means "serve the resource", deciding 200/403/404 from the file.
    code: Option<u16>,
    file: Option<MappedFile>,
}

impl HttpResponse {
    pub fn new(root: &Path, path: &str, keep_alive: bool, code: Option<u16>) -> Self {
        Self {
            root: root.to_path_buf(),
            path: path.to_string(),
            keep_alive,
            code,
            file: None,
        }
    }

    /// Final status code; meaningful after [`make`](Self::make).
    pub fn code(&self) -> u16 {
        self.code.unwrap_or(200)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn file(&self) -> Option<&MappedFile> {
        self.file.as_ref()
    }

    pub fn take_file(&mut self) -> Option<MappedFile> {
        self.file.take()
    }

    pub fn make(&mut self, buf: &mut Buffer) {
        let code = match self.code {
            None | Some(200) => match resource::lookup(&self.root, &self.path) {
                Resource::Found(_) => 200,
                Resource::NotFound => 404,
                Resource::Forbidden => 403,
            },
            Some(c) if status_reason(c).is_some() => c,
            Some(_) => 400,
        };
        self.code = Some(code);
        if code != 200 {
            self.path = format!("/{}.html", code);
        }

        self.add_status_line(buf, code);
        self.add_headers(buf);
        self.add_content(buf, code);
    }

    fn add_status_line(&self, buf: &mut Buffer, code: u16) {
        let reason = status_reason(code).unwrap_or("Bad Request");
        let _ = write!(buf, "HTTP/1.1 {} {}\r\n", code, reason);
    }

    fn add_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        let _ = write!(buf, "Content-Type: {}\r\n", content_type(&self.path));
        let _ = write!(buf, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
    }

    fn add_content(&mut self, buf: &mut Buffer, code: u16) {
        // Error pages come from the root when the site ships them.
        if let Resource::Found(_) = resource::lookup(&self.root, &self.path)
            && let Some(full) = resource::resolve(&self.root, &self.path)
        {
            match MappedFile::open(&full) {
                Ok(file) => {
                    let _ = write!(buf, "Content-Length: {}\r\n\r\n", file.len());
                    if !file.is_empty() {
                        self.file = Some(file);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(path = %full.display(), error = %e, "failed to map resource");
                }
            }
        }
        self.error_content(buf, code, "File NotFound!");
    }

    fn error_content(&self, buf: &mut Buffer, code: u16, message: &str) {
        let status = status_reason(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>webserv</em></body></html>",
            code, status, message
        );
        let _ = write!(buf, "Content-Length: {}\r\n\r\n", body.len());
        buf.append(body.as_bytes());
    }
}
