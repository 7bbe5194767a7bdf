// src/conn.rs
//! One client socket: its buffers, the request parser and the response writer.
//!
//! A connection is driven by exactly one thread at a time. The dispatcher
//! calls [`HttpConnection::read_once`] and [`HttpConnection::write`]; a pool
//! worker calls [`HttpConnection::process`] while it owns the connection.

use crate::buffer::{BufferFull, ReadBuf, WriteBuf};
use crate::config::Trigger;
use crate::docroot::{DEFAULT_CONTENT_TYPE, DocRoot};
use crate::http::{HttpCode, LineStatus, Method, Next, Phase, Request};
use crate::parser;
use crate::syscalls;
use memmap2::Mmap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

pub struct HttpConnection {
    fd: RawFd,
    addr: SocketAddr,
    root: Arc<DocRoot>,
    trigger: Trigger,

    read: ReadBuf,
    phase: Phase,
    request: Request,
    outcome: HttpCode,

    write: WriteBuf,
    file: Option<Mmap>,
    file_path: Option<PathBuf>,
    send_body: bool,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl HttpConnection {
    /// Take ownership of an accepted, non-blocking socket.
    pub fn new(fd: RawFd, addr: SocketAddr, root: Arc<DocRoot>, trigger: Trigger) -> Self {
        Self {
            fd,
            addr,
            root,
            trigger,
            read: ReadBuf::new(),
            phase: Phase::default(),
            request: Request::default(),
            outcome: HttpCode::NoRequest,
            write: WriteBuf::new(),
            file: None,
            file_path: None,
            send_body: true,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.fd < 0
    }

    /// Last terminal outcome; `NoRequest` while a request is still arriving.
    pub fn outcome(&self) -> HttpCode {
        self.outcome
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn read_buffer(&self) -> &ReadBuf {
        &self.read
    }

    /// Request body bytes once the body is complete.
    pub fn body(&self) -> Option<&[u8]> {
        self.request.body.clone().map(|range| self.read.slice(range))
    }

    /// The response head built by the last [`HttpConnection::process`].
    pub fn response_head(&self) -> &[u8] {
        self.write.as_bytes()
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn bytes_have_send(&self) -> usize {
        self.bytes_have_send
    }

    /// Pull available bytes off the socket. `false` means the peer is gone,
    /// the socket failed, or the buffer has no room left.
    pub fn read_once(&mut self) -> bool {
        if self.is_closed() || self.read.is_full() {
            return false;
        }
        loop {
            match syscalls::read_nonblocking(self.fd, self.read.spare_mut()) {
                Ok(Some(0)) => {
                    self.outcome = HttpCode::ClosedConnection;
                    return false;
                }
                Ok(Some(n)) => {
                    self.read.commit(n);
                    if self.trigger == Trigger::Level || self.read.is_full() {
                        return true;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    tracing::debug!(peer = %self.addr, error = %e, "read failed");
                    self.outcome = HttpCode::ClosedConnection;
                    return false;
                }
            }
        }
    }

    /// Parse whatever has arrived and, once a request is complete, build
    /// its response.
    pub fn process(&mut self) -> Next {
        let code = self.process_read();
        if code == HttpCode::NoRequest {
            return Next::Read;
        }
        self.outcome = code;
        if self.process_write(code) {
            Next::Write
        } else {
            Next::Close
        }
    }

    /// Advance the parser as far as the buffered bytes allow.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            let line = if self.phase == Phase::Content {
                None
            } else {
                match parser::parse_line(&mut self.read) {
                    LineStatus::Ok(range) => Some(range),
                    LineStatus::Bad => return HttpCode::BadRequest,
                    LineStatus::Open if self.read.is_full() => return HttpCode::BadRequest,
                    LineStatus::Open => return HttpCode::NoRequest,
                }
            };

            match self.phase {
                Phase::RequestLine => {
                    let Some(text) = line.and_then(|r| self.read.text(r)) else {
                        return HttpCode::BadRequest;
                    };
                    match parser::parse_request_line(text, &mut self.request, &mut self.phase) {
                        HttpCode::NoRequest => continue,
                        code => return code,
                    }
                }
                Phase::Headers => {
                    let Some(text) = line.and_then(|r| self.read.text(r)) else {
                        return HttpCode::BadRequest;
                    };
                    match parser::parse_header(text, &mut self.request, &mut self.phase) {
                        HttpCode::GetRequest => return self.do_request(),
                        HttpCode::NoRequest => {
                            let room = self.read.capacity() - self.read.checked_idx();
                            if self.phase == Phase::Content && self.request.content_length > room {
                                return HttpCode::BadRequest;
                            }
                        }
                        code => return code,
                    }
                }
                Phase::Content => {
                    return match parser::parse_content(&mut self.read, &mut self.request) {
                        HttpCode::GetRequest => self.do_request(),
                        code => code,
                    };
                }
            }
        }
    }

    /// Resolve the parsed URL against the document root and map the file.
    pub fn do_request(&mut self) -> HttpCode {
        match self.root.resolve(&self.request.url) {
            Ok(resolved) => {
                self.file = Some(resolved.map);
                self.file_path = Some(resolved.path);
                HttpCode::FileRequest
            }
            Err(code) => code,
        }
    }

    /// Build the response for `code`. A response that overflows the header
    /// buffer is replaced by a 500; `false` when not even that fits.
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        match self.render(code) {
            Ok(()) => true,
            Err(full) if code != HttpCode::InternalError => {
                tracing::warn!(peer = %self.addr, ?code, error = %full, "response too large, sending 500");
                self.outcome = HttpCode::InternalError;
                self.render(HttpCode::InternalError).is_ok()
            }
            Err(_) => false,
        }
    }

    fn render(&mut self, code: HttpCode) -> Result<(), BufferFull> {
        self.write.clear();
        self.bytes_have_send = 0;
        self.bytes_to_send = 0;
        self.send_body = false;
        if code != HttpCode::FileRequest {
            self.unmap();
        }

        let Some((status, title)) = code.status() else {
            return Err(BufferFull {
                capacity: self.write.capacity(),
            });
        };
        // The stream is out of sync after a malformed request.
        if matches!(code, HttpCode::BadRequest | HttpCode::InternalError) {
            self.request.keep_alive = false;
        }
        let keep_alive = self.request.keep_alive;

        if code == HttpCode::FileRequest {
            let (Some(map), Some(path)) = (self.file.as_ref(), self.file_path.as_ref()) else {
                return Err(BufferFull {
                    capacity: self.write.capacity(),
                });
            };
            let content_type = self.root.content_type_for(path);
            let result = write_head(&mut self.write, status, title, map.len(), content_type, keep_alive);
            if let Err(full) = result {
                self.write.clear();
                return Err(full);
            }
            self.send_body = self.request.method != Some(Method::Head);
            self.bytes_to_send = self.write.len() + if self.send_body { map.len() } else { 0 };
            return Ok(());
        }

        let page = code.error_page().unwrap_or_default();
        let head_only = self.request.method == Some(Method::Head);
        let result = write_head(&mut self.write, status, title, page.len(), DEFAULT_CONTENT_TYPE, keep_alive)
            .and_then(|()| {
                if head_only {
                    Ok(())
                } else {
                    self.write.push(page.as_bytes())
                }
            });
        if let Err(full) = result {
            self.write.clear();
            return Err(full);
        }
        self.bytes_to_send = self.write.len();
        Ok(())
    }

    /// Flush the pending response.
    pub fn write(&mut self) -> Next {
        if self.is_closed() {
            return Next::Close;
        }
        if self.bytes_to_send == 0 {
            self.reset();
            return Next::Read;
        }

        loop {
            let result = {
                let head = self.write.as_bytes();
                let body: &[u8] = match (&self.file, self.send_body) {
                    (Some(map), true) => &map[..],
                    _ => &[],
                };
                let sent = self.bytes_have_send;
                let (head, body) = if sent < head.len() {
                    (&head[sent..], body)
                } else {
                    (&[][..], &body[(sent - head.len()).min(body.len())..])
                };
                syscalls::writev_nonblocking(self.fd, &[head, body])
            };

            match result {
                Ok(None) => return Next::Write,
                Ok(Some(0)) => {
                    self.unmap();
                    return Next::Close;
                }
                Ok(Some(n)) => {
                    self.bytes_have_send += n;
                    if self.bytes_have_send >= self.bytes_to_send {
                        self.unmap();
                        if self.request.keep_alive {
                            self.reset();
                            return Next::Read;
                        }
                        return Next::Close;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %self.addr, error = %e, "write failed");
                    self.unmap();
                    return Next::Close;
                }
            }
        }
    }

    /// Rewind for the next request on a kept-alive connection. Buffers are
    /// reused, not reallocated.
    pub fn reset(&mut self) {
        self.read.clear();
        self.write.clear();
        self.phase = Phase::default();
        self.request.clear();
        self.outcome = HttpCode::NoRequest;
        self.unmap();
        self.send_body = true;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    fn unmap(&mut self) {
        self.file = None;
        self.file_path = None;
    }

    /// Close the socket. Returns `true` only for the call that actually
    /// closed it, so callers can keep an exact live count.
    pub fn close_conn(&mut self, real_close: bool) -> bool {
        if !real_close || self.is_closed() {
            return false;
        }
        tracing::debug!(peer = %self.addr, fd = self.fd, "closing connection");
        self.unmap();
        syscalls::close_fd(self.fd);
        self.fd = -1;
        true
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.close_conn(true);
    }
}

fn write_head(
    w: &mut WriteBuf,
    status: u16,
    title: &str,
    content_length: usize,
    content_type: &str,
    keep_alive: bool,
) -> Result<(), BufferFull> {
    w.push_fmt(format_args!("HTTP/1.1 {status} {title}\r\n"))?;
    w.push(b"Content-Length: ")?;
    w.push_usize(content_length)?;
    w.push(b"\r\n")?;
    w.push_fmt(format_args!("Content-Type: {content_type}\r\n"))?;
    w.push_fmt(format_args!(
        "Date: {}\r\n",
        httpdate::fmt_http_date(SystemTime::now())
    ))?;
    w.push(if keep_alive {
        b"Connection: keep-alive\r\n"
    } else {
        b"Connection: close\r\n"
    })?;
    w.push(b"\r\n")
}
