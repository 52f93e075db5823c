//! # murmur-shared
//!
//! Record shapes, identifiers and the message cipher shared by every Murmur
//! crate. Field names of the wire records are part of the backend contract and
//! must not change.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, MurmurError};
