//! Small helpers shared by the store, the fetcher and the CLI.
//!
//! - **URL validation**: scheme checks plus an optional SSRF guard
//! - **Text**: whitespace collapsing and name sanitizing

mod text;
mod url_validator;

pub use text::{collapse_whitespace, sanitize_name};
pub use url_validator::{validate_url, HostPolicy, UrlValidationError};
