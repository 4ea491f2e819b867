//! Request handling chain.
//!
//! `FileHandler` does plain static serving. `CorsHandler` wraps any
//! [`AssetSource`] and layers the browser-facing behavior on top:
//!
//! - every response carries the CORS headers
//! - `OPTIONS` to any path is answered directly with an empty 200
//! - `GET` for a script extension bypasses MIME inference and is sent
//!   as `application/javascript` with the file's bytes untouched, unless
//!   the path names a directory

use crate::http::{Method, Request, Response};
use std::io;
use std::path::Path;
use tracing::debug;

/// Content type forced onto script assets
pub const SCRIPT_MIME_TYPE: &str = "application/javascript";

/// Headers added to every response
pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "*"),
];

/// Turns a request into a response.
///
/// Implementations are called from blocking worker threads and may do
/// synchronous filesystem I/O.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

/// A handler backed by files that can also hand out raw contents.
pub trait AssetSource: Handler {
    /// Whether a decoded URL path maps to a directory.
    fn is_directory(&self, url_path: &str) -> bool;

    /// Bytes of the regular file a decoded URL path maps to.
    fn read_asset(&self, url_path: &str) -> io::Result<Vec<u8>>;
}

/// Add the CORS headers to a response.
pub fn with_cors(mut response: Response) -> Response {
    for (name, value) in CORS_HEADERS {
        response.set_header(name, value);
    }
    response
}

/// CORS and script-type decorator around a file-serving handler.
pub struct CorsHandler<H> {
    inner: H,
    script_extensions: Vec<String>,
}

impl<H: AssetSource> CorsHandler<H> {
    /// `script_extensions` are matched case-insensitively, without the dot.
    pub fn new(inner: H, script_extensions: Vec<String>) -> Self {
        CorsHandler {
            inner,
            script_extensions,
        }
    }

    fn is_script(&self, url_path: &str) -> bool {
        if url_path.ends_with('/') {
            return false;
        }
        Path::new(url_path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.script_extensions
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    fn serve_script(&self, url_path: &str) -> Response {
        match self.inner.read_asset(url_path) {
            Ok(contents) => Response::with_body(200, SCRIPT_MIME_TYPE, contents),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(path = %url_path, error = %e, "Script not readable");
                Response::error(403, "Permission denied")
            }
            Err(e) => {
                debug!(path = %url_path, error = %e, "Script not found");
                Response::error(404, "File not found")
            }
        }
    }
}

impl<H: AssetSource> Handler for CorsHandler<H> {
    fn handle(&self, request: &Request) -> Response {
        let response = match request.method {
            // Preflight never checks the resource
            Method::Options => Response::ok(),
            // A directory named like a script gets the default redirect
            Method::Get
                if self.is_script(&request.path) && !self.inner.is_directory(&request.path) =>
            {
                self.serve_script(&request.path)
            }
            _ => self.inner.handle(request),
        };
        with_cors(response)
    }
}
