//! Administrative control socket.
//!
//! A local unix stream socket (mode 0700) speaking JSON over HTTP/1.1. The
//! admin CLI is a thin client over it; the server side translates requests
//! into registry operations and dataplane queries. Caller mistakes map to
//! 4xx, store or dataplane failures to 5xx.

pub mod client;
pub mod server;

use std::path::Path;
use std::path::PathBuf;

pub use client::ControlClient;
pub use client::ControlClientError;
pub use server::ControlServer;
pub use server::TokenRequest;

/// Default control socket path.
pub const CONTROL_SOCKET_PATH: &str = "/tmp/wagd.sock";

/// Resolve the effective socket path.
pub fn socket_path(overridden: Option<&Path>) -> PathBuf {
    overridden.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(CONTROL_SOCKET_PATH))
}
