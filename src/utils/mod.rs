//! # Utility Functions and Types
//!
//! Common helpers shared across codec parsers and container formats:
//!
//! - Bit-level reading and writing, including Exp-Golomb coding
//! - CRC-32 in its MPEG-2 and OGG parameterizations
//!
//! ## Bit Operations
//!
//! ```rust
//! use remuxio::utils::BitReader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = vec![0b10110011u8];
//! let mut reader = BitReader::new(&data);
//! let value = reader.read_bits(3)?; // reads 0b101
//! assert_eq!(value, 0b101);
//! # Ok(())
//! # }
//! ```

/// Bit manipulation and bitstream reading/writing utilities
pub mod bits;

/// CRC calculation implementations
pub mod crc;

pub use bits::{BitReader, BitWriter};
pub use crc::{Crc32Mpeg2, Crc32Ogg};
