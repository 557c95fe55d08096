// src/files.rs
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::http::HttpCode;

/// Longest absolute path (document root + URL) the server will resolve.
pub const MAX_PATH_LEN: usize = 200;

const WORLD_READABLE: u32 = 0o004;

/// A file mapped read-only for the lifetime of one response.
///
/// Dropping it unmaps the file, so every exit path of a request releases the
/// mapping without bookkeeping.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directory the server serves files from.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    root: PathBuf,
    index: String,
}

impl DocumentRoot {
    pub fn new(root: impl Into<PathBuf>, index: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index: index.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a request URL: the root followed by the URL bytes,
    /// with `/` standing for the index document.
    pub fn real_path(&self, url: &str) -> Result<PathBuf, HttpCode> {
        if url.split('/').any(|segment| segment == "..") {
            debug!(url, "refusing path traversal");
            return Err(HttpCode::ForbiddenRequest);
        }

        let mut real = OsString::from(self.root.as_os_str());
        real.push(url);
        if url == "/" {
            real.push(&self.index);
        }

        if real.len() > MAX_PATH_LEN {
            debug!(len = real.len(), "request path too long");
            return Err(HttpCode::BadRequest);
        }
        Ok(PathBuf::from(real))
    }

    /// Resolve `url` and map the target. The error carries the response family.
    pub fn map(&self, url: &str) -> Result<MappedFile, HttpCode> {
        let path = self.real_path(url)?;

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(HttpCode::ForbiddenRequest);
            }
            Err(_) => return Err(HttpCode::NoResource),
        };

        if meta.permissions().mode() & WORLD_READABLE == 0 {
            return Err(HttpCode::ForbiddenRequest);
        }
        if meta.is_dir() {
            return Err(HttpCode::BadRequest);
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(HttpCode::ForbiddenRequest);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open resolved file");
                return Err(HttpCode::InternalError);
            }
        };

        // mmap(2) rejects zero-length mappings.
        if meta.len() == 0 {
            return Ok(MappedFile { path, map: None });
        }

        // SAFETY: the mapping is read-only and private to this response. A
        // concurrent truncation of the file by another process is outside the
        // server's control, as with any static file server built on mmap.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => Ok(MappedFile {
                path,
                map: Some(map),
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to map file");
                Err(HttpCode::InternalError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;

    fn site() -> (tempfile::TempDir, DocumentRoot) {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.html");
        fs::write(&index, b"<h1>home</h1>").unwrap();
        fs::set_permissions(&index, Permissions::from_mode(0o644)).unwrap();
        let docs = DocumentRoot::new(dir.path(), "index.html");
        (dir, docs)
    }

    #[test]
    fn test_index_document() {
        let (_dir, docs) = site();
        let file = docs.map("/").unwrap();
        assert_eq!(file.bytes(), b"<h1>home</h1>");
        assert_eq!(file.len(), 13);
        assert!(file.path().ends_with("index.html"));
    }

    #[test]
    fn test_missing_file() {
        let (_dir, docs) = site();
        assert_eq!(docs.map("/nope.html").unwrap_err(), HttpCode::NoResource);
    }

    #[test]
    fn test_not_world_readable() {
        let (dir, docs) = site();
        let secret = dir.path().join("secret.txt");
        fs::write(&secret, b"classified").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o600)).unwrap();
        assert_eq!(docs.map("/secret.txt").unwrap_err(), HttpCode::ForbiddenRequest);
    }

    #[test]
    fn test_directory() {
        let (dir, docs) = site();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::set_permissions(dir.path().join("sub"), Permissions::from_mode(0o755)).unwrap();
        assert_eq!(docs.map("/sub").unwrap_err(), HttpCode::BadRequest);
    }

    #[test]
    fn test_traversal_refused() {
        let (_dir, docs) = site();
        assert_eq!(docs.map("/../etc/passwd").unwrap_err(), HttpCode::ForbiddenRequest);
        assert_eq!(docs.map("/a/../../x").unwrap_err(), HttpCode::ForbiddenRequest);
    }

    #[test]
    fn test_overlong_path() {
        let (_dir, docs) = site();
        let url = format!("/{}", "a".repeat(MAX_PATH_LEN));
        assert_eq!(docs.real_path(&url).unwrap_err(), HttpCode::BadRequest);
        assert_eq!(docs.map(&url).unwrap_err(), HttpCode::BadRequest);
    }

    #[test]
    fn test_empty_file() {
        let (dir, docs) = site();
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();
        fs::set_permissions(&empty, Permissions::from_mode(0o644)).unwrap();
        let file = docs.map("/empty.txt").unwrap();
        assert!(file.is_empty());
        assert_eq!(file.bytes(), b"");
    }
}
