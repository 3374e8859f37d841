//! mTLS transport proxy (port 8443).
//!
//! Terminates client TLS, discovers the destination hostname from the
//! first bytes of the stream, authorizes against the zone access list,
//! and tunnels the connection to the real backend.

mod discovery;
mod listener;
mod tunnel;

pub use discovery::{discover_hostname, parse_sni};
pub use listener::ProxyServer;
pub use tunnel::run_tunnel;

use std::time::Duration;

/// Maximum bytes peeked for hostname discovery; all of them are replayed
/// to the backend.
pub const MAX_PEEK_BYTES: usize = 8192;

/// Deadline for the initial peek.
pub const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the backend dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
