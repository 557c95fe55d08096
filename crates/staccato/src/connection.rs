// src/connection.rs
//
// Per-socket state. A `Connection` is owned by exactly one thread at a time:
// the reactor does the socket I/O, a worker runs `process`, and the box is
// moved between them rather than shared.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::files::DocumentRoot;
use crate::http::HttpCode;
use crate::parser::RequestParser;
use crate::response::Response;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted, not yet armed.
    Idle,
    /// Armed for read readiness.
    Reading,
    /// Waiting in the worker queue.
    Queued,
    /// Held by a worker.
    Processing,
    /// A response is pending.
    Writing,
    /// Must be torn down.
    Closing,
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The socket stopped accepting bytes; wait for write readiness.
    Pending,
    /// The whole response went out.
    Complete,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    docs: Arc<DocumentRoot>,
    phase: Phase,
    request: RequestParser,
    response: Response,
    last_active: Instant,
    requests_served: u64,
    written: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, docs: Arc<DocumentRoot>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            peer,
            docs,
            phase: Phase::Idle,
            request: RequestParser::new(),
            response: Response::new(),
            last_active: Instant::now(),
            requests_served: 0,
            written: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn request(&self) -> &RequestParser {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Bytes written since the last call.
    pub fn take_written(&mut self) -> usize {
        std::mem::take(&mut self.written)
    }

    /// Drain the socket into the read buffer until it would block or the
    /// buffer is full. Returns the number of bytes read.
    pub fn read(&mut self) -> ServerResult<usize> {
        if self.request.is_full() {
            return Err(ServerError::BufferFull);
        }

        let mut total = 0;
        loop {
            let spare = self.request.spare_mut();
            if spare.is_empty() {
                break;
            }
            match self.stream.read(spare) {
                Ok(0) => return Err(ServerError::PeerClosed),
                Ok(n) => {
                    self.request.commit(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Parse what has been read and, for a complete request, build the
    /// response. Leaves the phase at `Reading`, `Writing` or `Closing` and
    /// returns the resolved outcome.
    pub fn process(&mut self) -> HttpCode {
        self.phase = Phase::Processing;

        let code = self.request.process_read();
        if code == HttpCode::NoRequest {
            self.phase = if self.request.is_full() {
                debug!(peer = %self.peer, "request does not fit the read buffer");
                Phase::Closing
            } else {
                Phase::Reading
            };
            return code;
        }

        let head = self.request.head();
        let outcome = match code {
            HttpCode::GetRequest => self.docs.map(&head.url),
            other => Err(other),
        };
        let resolved = match &outcome {
            Ok(_) => HttpCode::FileRequest,
            Err(code) => *code,
        };
        debug!(
            peer = %self.peer,
            method = ?head.method,
            url = %head.url,
            outcome = ?resolved,
            "request resolved"
        );

        let (method, keep_alive) = (head.method, head.keep_alive);
        self.phase = if self.response.build(outcome, method, keep_alive) {
            Phase::Writing
        } else {
            debug!(peer = %self.peer, "response does not fit the write buffer");
            Phase::Closing
        };
        resolved
    }

    /// Push the pending response out with vectored writes. On completion a
    /// keep-alive connection is reset for its next request (phase `Reading`);
    /// anything else ends in `Closing`.
    pub fn write(&mut self) -> ServerResult<Flush> {
        while !self.response.is_complete() {
            let result = self.stream.write_vectored(&self.response.segments());
            match result {
                Ok(0) => return Err(ServerError::WriteZero),
                Ok(n) => {
                    self.response.advance(n);
                    self.written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.requests_served += 1;
        if self.response.keep_alive() {
            self.request.reset();
            self.response.reset();
            self.phase = Phase::Reading;
        } else {
            self.phase = Phase::Closing;
        }
        Ok(Flush::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, Permissions};
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::Duration;

    const PAGE: &[u8] = b"<html><body>staccato</body></html>";

    fn setup() -> (tempfile::TempDir, TcpStream, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.html");
        fs::write(&index, PAGE).unwrap();
        fs::set_permissions(&index, Permissions::from_mode(0o644)).unwrap();
        let docs = Arc::new(DocumentRoot::new(dir.path(), "index.html"));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let conn = Connection::new(stream, peer, docs).unwrap();
        (dir, client, conn)
    }

    /// Read until at least one byte arrived; the socket is non-blocking.
    fn read_some(conn: &mut Connection) -> usize {
        for _ in 0..200 {
            let n = conn.read().unwrap();
            if n > 0 {
                return n;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no data arrived");
    }

    fn read_response(client: &mut TcpStream, len: usize) -> Vec<u8> {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut out = vec![0; len];
        client.read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let (_dir, mut client, mut conn) = setup();
        assert_eq!(conn.phase(), Phase::Idle);

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        read_some(&mut conn);
        assert_eq!(conn.process(), HttpCode::FileRequest);
        assert_eq!(conn.phase(), Phase::Writing);

        let expected = conn.response().bytes_to_send();
        assert_eq!(conn.write().unwrap(), Flush::Complete);
        assert_eq!(conn.take_written(), expected);
        assert_eq!(conn.take_written(), 0);
        assert_eq!(conn.phase(), Phase::Reading);
        assert_eq!(conn.requests_served(), 1);
        assert_eq!(conn.request().read_idx(), 0);

        let wire = read_response(&mut client, expected);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", PAGE.len())));
        assert!(text.ends_with(std::str::from_utf8(PAGE).unwrap()));
    }

    #[test]
    fn test_partial_request_waits() {
        let (_dir, mut client, mut conn) = setup();
        client.write_all(b"GET /index.html HT").unwrap();
        read_some(&mut conn);
        assert_eq!(conn.process(), HttpCode::NoRequest);
        assert_eq!(conn.phase(), Phase::Reading);

        client.write_all(b"TP/1.1\r\n\r\n").unwrap();
        read_some(&mut conn);
        assert_eq!(conn.process(), HttpCode::FileRequest);
    }

    #[test]
    fn test_missing_file_without_keep_alive_closes() {
        let (_dir, mut client, mut conn) = setup();
        client.write_all(b"GET /nope.html HTTP/1.1\r\n\r\n").unwrap();
        read_some(&mut conn);
        assert_eq!(conn.process(), HttpCode::NoResource);
        let len = conn.response().bytes_to_send();
        assert_eq!(conn.write().unwrap(), Flush::Complete);
        assert_eq!(conn.phase(), Phase::Closing);

        let text = String::from_utf8(read_response(&mut client, len)).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_oversized_request_closes() {
        let (_dir, mut client, mut conn) = setup();
        let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        request.resize(4096, b'a');
        client.write_all(&request).unwrap();

        let mut total = 0;
        while !conn.request().is_full() {
            total += read_some(&mut conn);
        }
        assert_eq!(total, crate::parser::READ_BUFFER_SIZE);
        assert_eq!(conn.process(), HttpCode::NoRequest);
        assert_eq!(conn.phase(), Phase::Closing);
        assert!(matches!(conn.read(), Err(ServerError::BufferFull)));
    }

    #[test]
    fn test_peer_close_is_reported() {
        let (_dir, client, mut conn) = setup();
        drop(client);
        let mut result = conn.read();
        for _ in 0..200 {
            if !matches!(result, Ok(0)) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
            result = conn.read();
        }
        let err = result.unwrap_err();
        assert!(err.is_disconnect());
    }
}
