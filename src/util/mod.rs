//! Small helpers shared by the normalizer, fetcher and destinations.
//!
//! - **Text**: HTML to plain text, word-boundary truncation, control
//!   character stripping, publisher names
//! - **URL validation**: refuses non-http(s) and internal-network targets

mod text;
mod url_validator;

pub use text::{
    collapse_whitespace, first_image_src, html_to_text, source_name, strip_control_chars,
    truncate_chars, UNTITLED,
};
pub use url_validator::{validate_url, UrlValidationError};

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Lowercase hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
