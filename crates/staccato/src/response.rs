// src/response.rs
use std::fmt;
use std::io::{IoSlice, Write};

use crate::files::MappedFile;
use crate::http::{HTTP_VERSION, HttpCode, Method, Status};

pub const WRITE_BUFFER_SIZE: usize = 2048;

/// Outgoing response: a header block in a fixed buffer plus, for files, the
/// mapped bytes as a second segment. The two go out with one `writev` and the
/// file is never copied.
pub struct Response {
    buf: Box<[u8; WRITE_BUFFER_SIZE]>,
    write_idx: usize,
    file: Option<MappedFile>,
    status: Option<Status>,
    keep_alive: bool,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl Response {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; WRITE_BUFFER_SIZE]),
            write_idx: 0,
            file: None,
            status: None,
            keep_alive: false,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    /// Drop any pending output, unmapping the file it referenced.
    pub fn reset(&mut self) {
        self.write_idx = 0;
        self.file = None;
        self.status = None;
        self.keep_alive = false;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    /// Serialize the response for a resolved request.
    ///
    /// `Ok` carries the file to send; `Err` carries the failure family. Returns
    /// `false` if the outcome has no response (an incomplete request) or the
    /// header block overflows the write buffer.
    pub fn build(
        &mut self,
        outcome: Result<MappedFile, HttpCode>,
        method: Method,
        keep_alive: bool,
    ) -> bool {
        self.reset();

        let (status, file) = match outcome {
            Ok(file) => (Status::Ok, Some(file)),
            Err(code) => match Status::for_code(code) {
                Some(status) if status != Status::Ok => (status, None),
                _ => return false,
            },
        };
        self.status = Some(status);
        self.keep_alive = keep_alive && status.allows_keep_alive();
        let send_body = method != Method::Head;

        match file {
            Some(file) => {
                if !self.add_status_line(status) || !self.add_headers(file.len()) {
                    return false;
                }
                if send_body && !file.is_empty() {
                    self.file = Some(file);
                }
            }
            None => {
                let body = status.body();
                if !self.add_status_line(status) || !self.add_headers(body.len()) {
                    return false;
                }
                if send_body && !self.add_content(body) {
                    return false;
                }
            }
        }

        self.bytes_to_send = self.write_idx + self.body().len();
        self.bytes_have_send = 0;
        true
    }

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut spare = &mut self.buf[self.write_idx..];
        let before = spare.len();
        if spare.write_fmt(args).is_err() {
            return false;
        }
        self.write_idx += before - spare.len();
        true
    }

    fn add_status_line(&mut self, status: Status) -> bool {
        self.add_response(format_args!(
            "{} {} {}\r\n",
            HTTP_VERSION,
            status.code(),
            status.reason()
        ))
    }

    fn add_headers(&mut self, content_length: usize) -> bool {
        self.add_content_type()
            && self.add_content_length(content_length)
            && self.add_linger()
            && self.add_blank_line()
    }

    fn add_content_type(&mut self) -> bool {
        self.add_response(format_args!("Content-Type: text/html\r\n"))
    }

    fn add_content_length(&mut self, content_length: usize) -> bool {
        self.add_response(format_args!("Content-Length: {}\r\n", content_length))
    }

    fn add_linger(&mut self) -> bool {
        let value = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Connection: {}\r\n", value))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Status line, headers and (for errors) the canned body.
    pub fn header_bytes(&self) -> &[u8] {
        &self.buf[..self.write_idx]
    }

    /// Mapped file bytes; empty for error responses and `HEAD`.
    pub fn body(&self) -> &[u8] {
        self.file.as_ref().map(MappedFile::bytes).unwrap_or(&[])
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn bytes_have_send(&self) -> usize {
        self.bytes_have_send
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_to_send == 0
    }

    /// The unsent remainder of both segments, ready for a vectored write.
    pub fn segments(&self) -> [IoSlice<'_>; 2] {
        let header = self.header_bytes();
        let body = self.body();
        let sent = self.bytes_have_send;
        if sent < header.len() {
            [IoSlice::new(&header[sent..]), IoSlice::new(body)]
        } else {
            let offset = (sent - header.len()).min(body.len());
            [IoSlice::new(&[]), IoSlice::new(&body[offset..])]
        }
    }

    /// Account for `n` bytes accepted by the socket.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.bytes_to_send);
        self.bytes_have_send += n;
        self.bytes_to_send -= n;
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
