// src/http.rs

/// The only protocol version the server speaks.
pub const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        const TABLE: [(&[u8], Method); 9] = [
            (b"GET", Method::Get),
            (b"POST", Method::Post),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"PATCH", Method::Patch),
            (b"HEAD", Method::Head),
            (b"OPTIONS", Method::Options),
            (b"TRACE", Method::Trace),
            (b"CONNECT", Method::Connect),
        ];
        TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b))
            .map(|&(_, method)| method)
            .unwrap_or(Method::Unknown)
    }
}

/// Outcome of reading and resolving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// The request is incomplete; wait for more bytes.
    NoRequest,
    /// A complete, well-formed request is ready to be resolved.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// The target resolved to a readable regular file.
    FileRequest,
    InternalError,
}

/// Response status family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    /// Status for a terminal request outcome; `None` while the request is
    /// incomplete or still unresolved.
    pub fn for_code(code: HttpCode) -> Option<Self> {
        match code {
            HttpCode::FileRequest => Some(Status::Ok),
            HttpCode::BadRequest => Some(Status::BadRequest),
            HttpCode::ForbiddenRequest => Some(Status::Forbidden),
            HttpCode::NoResource => Some(Status::NotFound),
            HttpCode::InternalError => Some(Status::InternalError),
            HttpCode::NoRequest | HttpCode::GetRequest => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Server Error",
        }
    }

    /// Canned HTML body sent in place of a file for error statuses.
    pub fn body(self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::BadRequest => {
                "<html><body><h1>400 Bad Request</h1><p>Your request has bad syntax or is inherently impossible to satisfy.</p></body></html>\n"
            }
            Status::Forbidden => {
                "<html><body><h1>403 Forbidden</h1><p>You do not have permission to get file from this server.</p></body></html>\n"
            }
            Status::NotFound => {
                "<html><body><h1>404 Not Found</h1><p>The requested file was not found on this server.</p></body></html>\n"
            }
            Status::InternalError => {
                "<html><body><h1>500 Internal Server Error</h1><p>There was an unusual problem serving the requested file.</p></body></html>\n"
            }
        }
    }

    /// Protocol and internal errors always end the connection, whatever the
    /// client asked for.
    pub fn allows_keep_alive(self) -> bool {
        !matches!(self, Status::BadRequest | Status::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_bytes() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"get"), Method::Get);
        assert_eq!(Method::from_bytes(b"POST"), Method::Post);
        assert_eq!(Method::from_bytes(b"HEAD"), Method::Head);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
        assert_eq!(Method::from_bytes(b""), Method::Unknown);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Status::for_code(HttpCode::FileRequest), Some(Status::Ok));
        assert_eq!(Status::for_code(HttpCode::NoResource), Some(Status::NotFound));
        assert_eq!(Status::for_code(HttpCode::NoRequest), None);
        assert_eq!(Status::for_code(HttpCode::GetRequest), None);
        assert_eq!(Status::NotFound.code(), 404);
        assert_eq!(Status::InternalError.reason(), "Internal Server Error");
    }

    #[test]
    fn test_keep_alive_policy() {
        assert!(Status::Ok.allows_keep_alive());
        assert!(Status::NotFound.allows_keep_alive());
        assert!(Status::Forbidden.allows_keep_alive());
        assert!(!Status::BadRequest.allows_keep_alive());
        assert!(!Status::InternalError.allows_keep_alive());
    }
}
