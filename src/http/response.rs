//! HTTP response builder and head encoder.

use crate::http::date::format_http_date;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// Value of the `Server` header
pub const SERVER_NAME: &str = concat!("imagedesk-server/", env!("CARGO_PKG_VERSION"));

/// Standard reason phrase for the status codes this server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Escape text for inclusion in generated HTML.
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// An HTTP response.
///
/// Headers keep insertion order. `Date`, `Content-Length` and `Connection`
/// are written by [`Response::encode_head`] and should not be set by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Response with a body and its content type.
    pub fn with_body(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(status);
        response.set_header("Content-Type", content_type);
        response.body = body.into();
        response
    }

    /// Small HTML error page.
    pub fn error(status: u16, message: &str) -> Self {
        let body = format!(
            "<!DOCTYPE HTML>\n\
             <html lang=\"en\">\n\
             <head>\n\
             <meta charset=\"utf-8\">\n\
             <title>Error response</title>\n\
             </head>\n\
             <body>\n\
             <h1>Error response</h1>\n\
             <p>Error code: {}</p>\n\
             <p>Message: {}.</p>\n\
             </body>\n\
             </html>\n",
            status,
            html_escape(message)
        );
        Self::with_body(status, "text/html; charset=utf-8", body)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[cfg(test)]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup.
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Builder form of [`Response::set_header`].
    pub fn header_line(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Encode the status line and headers, stamped with the current time.
    ///
    /// The body is not included; write [`Response::payload`] after the
    /// head so large files are never copied into the head buffer.
    pub fn encode_head(&self, keep_alive: bool) -> BytesMut {
        self.encode_head_at(keep_alive, Utc::now())
    }

    fn encode_head_at(&self, keep_alive: bool, now: DateTime<Utc>) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);

        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        out.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        out.extend_from_slice(format!("Date: {}\r\n", format_http_date(now)).as_bytes());

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        // 304 never carries a body or a length
        if self.status != 304 {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n\r\n".as_slice()
        } else {
            b"Connection: close\r\n\r\n".as_slice()
        });
        out
    }

    /// Body to send after the head, if any.
    ///
    /// HEAD requests keep `Content-Length` but send nothing.
    pub fn payload(&self, head_only: bool) -> Option<&Bytes> {
        if head_only || self.status == 304 || self.body.is_empty() {
            None
        } else {
            Some(&self.body)
        }
    }
}
