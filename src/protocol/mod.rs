//! PostgreSQL wire protocol implementation.
//!
//! This module contains the low-level protocol encoding and decoding.
//!
//! # Structure
//!
//! - `backend`: Server → Client messages (parsing)
//! - `frontend`: Client → Server messages (encoding)
//! - `codec`: Low-level encoding/decoding primitives and message framing
//! - `auth`: MD5 and SCRAM-SHA-256 secret computation
//! - `types`: Common protocol types (FormatCode, Oid, TransactionStatus)

pub mod auth;
pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use codec::Frame;
pub use types::{FormatCode, Oid, TransactionStatus};
