//! # Fynx Platform
//!
//! Core platform types shared by the Fynx crates.
//!
//! This crate provides the unified error type (`FynxError`, `FynxResult`)
//! used across protocol implementations.
//!
//! # Examples
//!
//! ```
//! use fynx_platform::{FynxError, FynxResult};
//!
//! fn check_padding(len: usize) -> FynxResult<usize> {
//!     if len < 4 {
//!         return Err(FynxError::protocol("padding too short"));
//!     }
//!     Ok(len)
//! }
//!
//! # fn main() -> FynxResult<()> {
//! assert_eq!(check_padding(8)?, 8);
//! assert!(check_padding(2).is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{FynxError, FynxResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
