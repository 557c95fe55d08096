// src/parser.rs
//
// Incremental HTTP/1.1 request parser. Bytes are appended to a fixed read
// buffer as they arrive; `process_read` resumes from the saved cursors each
// time, so a request split over any number of reads parses exactly like the
// same bytes delivered at once.
use memchr::memchr2;
use tracing::{debug, trace};

use crate::http::{HTTP_VERSION, HttpCode, Method};

pub const READ_BUFFER_SIZE: usize = 2048;

/// Result of scanning for the next `\r\n`-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    Bad,
    Open,
}

/// Stage of the request automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Header,
    Content,
}

/// Semantic fields extracted from the request line and headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Path component of the target, always starting with `/`.
    pub url: String,
    pub version: String,
    pub host: Option<String>,
    pub keep_alive: bool,
    pub content_length: usize,
}

pub struct RequestParser {
    buf: Box<[u8; READ_BUFFER_SIZE]>,
    read_idx: usize,
    check_idx: usize,
    line_start: usize,
    state: CheckState,
    head: RequestHead,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; READ_BUFFER_SIZE]),
            read_idx: 0,
            check_idx: 0,
            line_start: 0,
            state: CheckState::RequestLine,
            head: RequestHead::default(),
        }
    }

    /// Forget everything about the current request. The buffer contents are
    /// left in place; the cursors make them unreachable.
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.check_idx = 0;
        self.line_start = 0;
        self.state = CheckState::RequestLine;
        self.head = RequestHead::default();
    }

    /// Free tail of the read buffer, for the socket to fill.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Mark `n` bytes of the spare tail as filled.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.read_idx = (self.read_idx + n).min(READ_BUFFER_SIZE);
    }

    /// Append as much of `bytes` as fits; returns how many were taken.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read_idx >= READ_BUFFER_SIZE
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn check_idx(&self) -> usize {
        self.check_idx
    }

    pub fn line_start(&self) -> usize {
        self.line_start
    }

    /// Request body, once `process_read` has reported a complete request.
    pub fn body(&self) -> &[u8] {
        let end = (self.check_idx + self.head.content_length).min(self.read_idx);
        &self.buf[self.check_idx.min(end)..end]
    }

    /// Scan `[check_idx, read_idx)` for the end of the current line.
    ///
    /// On `Ok` the cursor sits just past the `\r\n`. A `\r` or `\n` that is the
    /// last available byte yields `Open` and keeps the cursor on it, so the
    /// byte is judged again once its successor arrives.
    pub fn parse_line(&mut self) -> LineStatus {
        let window = &self.buf[self.check_idx..self.read_idx];
        let Some(offset) = memchr2(b'\r', b'\n', window) else {
            self.check_idx = self.read_idx;
            return LineStatus::Open;
        };

        let at = self.check_idx + offset;
        if at + 1 == self.read_idx {
            self.check_idx = at;
            return LineStatus::Open;
        }

        // A '\n' found first has no '\r' before it in this line.
        if self.buf[at] == b'\r' && self.buf[at + 1] == b'\n' {
            self.check_idx = at + 2;
            LineStatus::Ok
        } else {
            self.check_idx = at;
            LineStatus::Bad
        }
    }

    /// Drive the request automaton as far as the buffered bytes allow.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                return self.parse_content();
            }

            match self.parse_line() {
                LineStatus::Ok => {}
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
            }

            let line = self.line_start..self.check_idx - 2;
            self.line_start = self.check_idx;
            let text = &self.buf[line];
            trace!(line = %String::from_utf8_lossy(text), "parsed line");

            match self.state {
                CheckState::RequestLine => {
                    if parse_request_line(text, &mut self.head) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                    self.state = CheckState::Header;
                }
                CheckState::Header if text.is_empty() => {
                    if self.head.content_length == 0 {
                        return HttpCode::GetRequest;
                    }
                    if self.head.content_length > READ_BUFFER_SIZE - self.check_idx {
                        debug!(
                            content_length = self.head.content_length,
                            "request body can never fit the read buffer"
                        );
                        return HttpCode::BadRequest;
                    }
                    self.state = CheckState::Content;
                }
                CheckState::Header => {
                    if parse_header(text, &mut self.head) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                }
                CheckState::Content => unreachable!("content stage handled above"),
            }
        }
    }

    fn parse_content(&self) -> HttpCode {
        if self.read_idx >= self.check_idx + self.head.content_length {
            HttpCode::GetRequest
        } else {
            HttpCode::NoRequest
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `METHOD URL VERSION`. Returns `NoRequest` to keep going, `BadRequest` otherwise.
fn parse_request_line(text: &[u8], head: &mut RequestHead) -> HttpCode {
    let mut tokens = text
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|token| !token.is_empty());

    let (Some(method), Some(url), Some(version)) = (tokens.next(), tokens.next(), tokens.next())
    else {
        return HttpCode::BadRequest;
    };

    let Some(url) = std::str::from_utf8(url).ok().and_then(normalize_url) else {
        return HttpCode::BadRequest;
    };

    head.method = Method::from_bytes(method);
    if head.method == Method::Unknown {
        debug!(method = %String::from_utf8_lossy(method), "unrecognized method, serving as GET");
    }
    head.url = url.to_owned();
    head.version = String::from_utf8_lossy(version).into_owned();
    if head.version != HTTP_VERSION {
        debug!(version = %head.version, "non HTTP/1.1 request accepted");
    }
    HttpCode::NoRequest
}

/// Strip an absolute-form `http://host` prefix down to its path.
fn normalize_url(url: &str) -> Option<&str> {
    let mut path = url;
    for scheme in ["http://", "https://"] {
        if path
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        {
            let authority = &path[scheme.len()..];
            path = &authority[authority.find('/')?..];
            break;
        }
    }
    path.starts_with('/').then_some(path)
}

fn parse_header(text: &[u8], head: &mut RequestHead) -> HttpCode {
    if let Some(value) = header_value(text, b"Connection") {
        head.keep_alive = value.eq_ignore_ascii_case(b"keep-alive");
    } else if let Some(value) = header_value(text, b"Content-Length") {
        match std::str::from_utf8(value).ok().and_then(|v| v.parse::<usize>().ok()) {
            Some(n) => head.content_length = n,
            None => return HttpCode::BadRequest,
        }
    } else if let Some(value) = header_value(text, b"Host") {
        head.host = Some(String::from_utf8_lossy(value).into_owned());
    } else {
        trace!(header = %String::from_utf8_lossy(text), "skipping header");
    }
    HttpCode::NoRequest
}

/// Value of `line` if it is the header `name` (case-insensitive), blanks trimmed.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let colon = name.len();
    if line.len() <= colon || line[colon] != b':' || !line[..colon].eq_ignore_ascii_case(name) {
        return None;
    }
    let is_blank = |b: &u8| *b == b' ' || *b == b'\t';
    let value = &line[colon + 1..];
    let start = value.iter().position(|b| !is_blank(b)).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !is_blank(b)).map_or(start, |i| i + 1);
    Some(&value[start..end])
}
