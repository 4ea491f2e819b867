//! Default static file handler.
//!
//! Serves the asset root over GET and HEAD: whole files with an inferred
//! content type, index files or generated listings for directories,
//! and `If-Modified-Since` revalidation.

use crate::handler::{AssetSource, Handler};
use crate::http::date::{format_http_date, parse_http_date};
use crate::http::response::html_escape;
use crate::http::uri::{percent_encode_path, split_target};
use crate::http::{Method, Request, Response};
use crate::mime;
use chrono::{DateTime, Utc};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files tried, in order, when a directory is requested
const INDEX_FILES: [&str; 2] = ["index.html", "index.htm"];

pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    /// Serve files under `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Asset root does not exist: {}", root.display()),
            ));
        }
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Asset root is not a directory: {}", root.display()),
            ));
        }

        Ok(FileHandler { root })
    }

    /// Map a decoded URL path onto the filesystem.
    ///
    /// Empty, `.` and `..` segments are dropped, so the result never
    /// leaves the root.
    pub fn resolve(&self, url_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in url_path.split('/') {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('\\')
                || segment.contains('\0')
            {
                continue;
            }
            path.push(segment);
        }
        path
    }

    fn serve(&self, request: &Request) -> Response {
        let path = self.resolve(&request.path);

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => return lookup_error(&request.path, &e),
        };

        if metadata.is_dir() {
            return self.serve_directory(request, &path);
        }
        if request.path.ends_with('/') {
            debug!(path = %request.path, "Trailing slash on a file");
            return Response::error(404, "File not found");
        }
        serve_file(request, &path, &metadata)
    }

    fn serve_directory(&self, request: &Request, dir: &Path) -> Response {
        if !request.path.ends_with('/') {
            // Relative links in the page need the trailing slash
            let (raw_path, _) = split_target(&request.target);
            let mut location = format!("{}/", raw_path);
            if let Some(query) = &request.query {
                location.push('?');
                location.push_str(query);
            }
            return Response::new(301).header_line("Location", &location);
        }

        for name in INDEX_FILES {
            let index = dir.join(name);
            if let Ok(metadata) = fs::metadata(&index) {
                if metadata.is_file() {
                    return serve_file(request, &index, &metadata);
                }
            }
        }

        list_directory(&request.path, dir)
    }
}

impl Handler for FileHandler {
    fn handle(&self, request: &Request) -> Response {
        match request.method {
            Method::Get | Method::Head => self.serve(request),
            ref other => Response::error(
                501,
                &format!("Unsupported method ('{}')", other),
            ),
        }
    }
}

impl AssetSource for FileHandler {
    fn is_directory(&self, url_path: &str) -> bool {
        fs::metadata(self.resolve(url_path))
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    fn read_asset(&self, url_path: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(url_path);
        if !fs::metadata(&path)?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Not a regular file: {}", path.display()),
            ));
        }
        fs::read(&path)
    }
}

fn serve_file(request: &Request, path: &Path, metadata: &Metadata) -> Response {
    let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    if let (Some(modified), Some(since)) = (
        last_modified,
        request.header("If-Modified-Since").and_then(parse_http_date),
    ) {
        // HTTP dates have whole-second precision
        if request.header("If-None-Match").is_none() && modified.timestamp() <= since.timestamp()
        {
            return Response::new(304).header_line("Last-Modified", &format_http_date(modified));
        }
    }

    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) => return read_error(path, &e),
    };

    let mut response = Response::with_body(200, mime::from_path(path), contents);
    if let Some(modified) = last_modified {
        response.set_header("Last-Modified", &format_http_date(modified));
    }
    response
}

fn list_directory(url_path: &str, dir: &Path) -> Response {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot list directory");
            return Response::error(404, "No permission to list directory");
        }
    };

    let mut names: Vec<String> = entries
        .flatten()
        .map(|entry| {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort_by_key(|name| name.to_lowercase());

    let title = format!("Directory listing for {}", html_escape(url_path));
    let mut html = format!(
        "<!DOCTYPE HTML>\n\
         <html lang=\"en\">\n\
         <head>\n\
         <meta charset=\"utf-8\">\n\
         <title>{title}</title>\n\
         </head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <hr>\n\
         <ul>\n"
    );
    for name in &names {
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            percent_encode_path(name),
            html_escape(name)
        ));
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>\n");

    Response::with_body(200, "text/html; charset=utf-8", html)
}

/// Response for a failed path lookup.
fn lookup_error(url_path: &str, e: &io::Error) -> Response {
    if e.kind() == io::ErrorKind::PermissionDenied {
        debug!(path = %url_path, "Permission denied");
        Response::error(403, "Permission denied")
    } else {
        debug!(path = %url_path, "File not found");
        Response::error(404, "File not found")
    }
}

/// Response for a file that was found but could not be read.
fn read_error(path: &Path, e: &io::Error) -> Response {
    match e.kind() {
        io::ErrorKind::NotFound => Response::error(404, "File not found"),
        io::ErrorKind::PermissionDenied => Response::error(403, "Permission denied"),
        _ => {
            warn!(path = %path.display(), error = %e, "Failed to read file");
            Response::error(500, "Internal server error")
        }
    }
}
