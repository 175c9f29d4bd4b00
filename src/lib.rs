//! HTTP gateway for PostgreSQL.
//!
//! `pg-http-proxy` accepts parameterized SQL over a single HTTP endpoint
//! and executes it against a bounded pool of hand-rolled wire-protocol v3
//! backend connections, streaming results back as JSON.
//!
//! # Structure
//!
//! - `protocol`: wire-protocol framing, message encoding/decoding
//! - `state`: sans-I/O state machines (startup handshake, extended query)
//! - `conn`: tokio driver owning one backend socket per connection
//! - `pool`: bounded FIFO-fair connection pool with replacement
//! - `gateway`: axum front end, error→status mapping, listener TLS
//! - `supervisor`: lifecycle (warm-up, readiness, graceful drain)

pub mod config;
pub mod conn;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod value;

pub use config::{BackendOpts, ProxyConfig, SslMode};
pub use error::{Error, ErrorFields, Result};
pub use pool::{Lease, Pool};
pub use supervisor::{Lifecycle, Supervisor};
pub use value::{Column, QueryRequest, ResultSet};
