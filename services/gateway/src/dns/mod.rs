//! DNS-over-TLS resolver (port 853).
//!
//! Accepts mutually-authenticated connections, answers queries for
//! private zones, and forwards everything else to the public upstream.

mod resolver;
mod server;
mod upstream;

pub use resolver::{answer_zone_query, build_raw_error, build_response, ZoneAnswer, RECORD_TTL};
pub use server::DotServer;
pub use upstream::forward_upstream;

use std::time::Duration;

/// Maximum accepted DoT message size.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Deadline for reading one framed message from a client.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the upstream UDP exchange.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
