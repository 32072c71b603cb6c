//! # Error Types
//!
//! This module provides the error types used throughout the remuxio library.
//! It defines a central error type `RemuxError` that encapsulates all
//! failures that can occur while parsing or producing container data.
//!
//! ## Example Usage
//!
//! ```rust
//! use remuxio::error::{Result, RemuxError};
//!
//! fn check_sync_byte(data: &[u8]) -> Result<()> {
//!     if data.first() != Some(&0x47) {
//!         return Err(RemuxError::Malformed("missing TS sync byte".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the remuxio library
#[derive(Error, Debug)]
pub enum RemuxError {
    /// I/O errors that occur during file or buffer operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected end of stream while reading a known-sized structure
    #[error("truncated input: {0}")]
    Truncated(String),

    /// Sentinel violations, wrong magic values, negative or nonsensical sizes
    #[error("malformed structure: {0}")]
    Malformed(String),

    /// A codec tag, box version or element the library recognizes but does
    /// not handle; the message identifies the construct
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// A muxer was asked for something its container or track setup cannot
    /// express (e.g. subtitles into OGG, audio without a sample rate)
    #[error("configuration mismatch: {0}")]
    Config(String),

    /// The conversion loop observed its cancel flag
    #[error("conversion cancelled")]
    Cancelled,
}

/// A specialized Result type for remuxio operations.
pub type Result<T> = std::result::Result<T, RemuxError>;
