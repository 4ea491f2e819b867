//! HTTP/1.x request parser.
//!
//! Parses the request line, headers and an optional `Content-Length`
//! body from the front of a connection buffer. The caller keeps reading
//! while the parser reports `Incomplete`.

use super::uri::{percent_decode, split_target};
use std::str;

/// Largest accepted request head (request line plus headers)
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Request method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version from the request line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Parsed HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target as sent
    pub target: String,
    /// Percent-decoded path without query or fragment
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Case-insensitive header lookup; the first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the connection should stay open after this request.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").map(|v| v.to_ascii_lowercase());
        let has = |token: &str| {
            connection
                .as_deref()
                .map(|v| v.split(',').any(|t| t.trim() == token))
                .unwrap_or(false)
        };
        match self.version {
            Version::Http11 => !has("close"),
            Version::Http10 => has("keep-alive"),
        }
    }
}

/// Request parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Malformed request line
    InvalidRequestLine(String),
    /// Malformed header line or header value
    InvalidHeader(String),
    /// Request line and headers exceed `MAX_HEADER_BYTES`
    HeaderTooLarge,
    /// Declared body exceeds `MAX_BODY_BYTES`
    BodyTooLarge(usize),
    /// Chunked or other transfer codings
    UnsupportedTransferEncoding,
    /// Anything other than HTTP/1.0 or HTTP/1.1
    UnsupportedVersion(String),
}

impl ParseError {
    /// Status code sent back for this error.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::InvalidRequestLine(_) | ParseError::InvalidHeader(_) => 400,
            ParseError::HeaderTooLarge => 431,
            ParseError::BodyTooLarge(_) => 413,
            ParseError::UnsupportedTransferEncoding => 501,
            ParseError::UnsupportedVersion(_) => 505,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidRequestLine(msg) => write!(f, "Invalid request line: {}", msg),
            ParseError::InvalidHeader(msg) => write!(f, "Invalid header: {}", msg),
            ParseError::HeaderTooLarge => write!(f, "Request header too large"),
            ParseError::BodyTooLarge(len) => write!(f, "Request body too large: {} bytes", len),
            ParseError::UnsupportedTransferEncoding => {
                write!(f, "Transfer-Encoding is not supported")
            }
            ParseError::UnsupportedVersion(v) => write!(f, "Unsupported HTTP version: {}", v),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing a request
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed request with bytes consumed
    Complete(Request, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(ParseError),
}

/// Parser for HTTP/1.x requests
pub struct Parser;

impl Parser {
    /// Parse a request from the front of the buffer
    pub fn parse(buffer: &[u8]) -> ParseResult {
        let head_end = match find_head_end(buffer) {
            Some(pos) if pos > MAX_HEADER_BYTES => {
                return ParseResult::Error(ParseError::HeaderTooLarge)
            }
            Some(pos) => pos,
            None if buffer.len() > MAX_HEADER_BYTES => {
                return ParseResult::Error(ParseError::HeaderTooLarge)
            }
            None => return ParseResult::Incomplete,
        };

        let head = match str::from_utf8(&buffer[..head_end]) {
            Ok(s) => s,
            Err(_) => {
                return ParseResult::Error(ParseError::InvalidRequestLine(
                    "Invalid UTF-8 in request head".to_string(),
                ))
            }
        };

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();

        let (method, target, version) = match Self::parse_request_line(request_line) {
            Ok(parts) => parts,
            Err(e) => return ParseResult::Error(e),
        };

        let mut headers = Vec::new();
        for line in lines {
            match Self::parse_header(line) {
                Ok(header) => headers.push(header),
                Err(e) => return ParseResult::Error(e),
            }
        }

        let content_length = match Self::body_length(&headers) {
            Ok(len) => len,
            Err(e) => return ParseResult::Error(e),
        };

        // The body is read past but not kept
        let total = head_end + 4 + content_length;
        if buffer.len() < total {
            return ParseResult::Incomplete;
        }

        let (path, query) = split_target(target);
        let request = Request {
            method,
            target: target.to_string(),
            path: percent_decode(path),
            query: query.map(str::to_string),
            version,
            headers,
        };

        ParseResult::Complete(request, total)
    }

    fn parse_request_line(line: &str) -> Result<(Method, &str, Version), ParseError> {
        let parts: Vec<&str> = line.split(' ').filter(|p| !p.is_empty()).collect();
        if parts.len() != 3 {
            return Err(ParseError::InvalidRequestLine(line.to_string()));
        }

        let method = parts[0];
        if !method.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ParseError::InvalidRequestLine(format!(
                "Invalid method: {}",
                method
            )));
        }

        let target = parts[1];
        if !(target.starts_with('/') || target == "*" || target.starts_with("http")) {
            return Err(ParseError::InvalidRequestLine(format!(
                "Invalid target: {}",
                target
            )));
        }

        let version = match parts[2] {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            other if other.starts_with("HTTP/") => {
                return Err(ParseError::UnsupportedVersion(other.to_string()))
            }
            other => {
                return Err(ParseError::InvalidRequestLine(format!(
                    "Invalid version: {}",
                    other
                )))
            }
        };

        Ok((Method::from_token(method), target, version))
    }

    fn parse_header(line: &str) -> Result<(String, String), ParseError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;

        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::InvalidHeader(line.to_string()));
        }

        Ok((name.to_string(), value.trim().to_string()))
    }

    fn body_length(headers: &[(String, String)]) -> Result<usize, ParseError> {
        if headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding"))
        {
            return Err(ParseError::UnsupportedTransferEncoding);
        }

        let value = match headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        {
            Some((_, v)) => v,
            None => return Ok(0),
        };

        let len = value
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidHeader(format!("Content-Length: {}", value)))?;

        if len > MAX_BODY_BYTES {
            return Err(ParseError::BodyTooLarge(len));
        }
        Ok(len)
    }
}

/// Position of the `\r\n\r\n` that ends the request head.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}
