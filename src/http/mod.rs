//! Minimal HTTP/1.x codec.
//!
//! - `date`: IMF-fixdate formatting and parsing
//! - `parser`: incremental request parsing from a byte buffer
//! - `response`: response construction and head encoding
//! - `uri`: request-target splitting and percent coding

pub mod date;
pub mod parser;
pub mod response;
pub mod uri;

pub use parser::{Method, ParseResult, Parser, Request};
pub use response::Response;
