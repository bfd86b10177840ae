//! Unix-socket transport for CSI messages.
//!
//! Every call uses its own connection: the client writes one JSON-encoded
//! [`CsiRequest`](crate::message::CsiRequest), shuts down its write half and
//! reads one JSON-encoded [`CsiMessage`](crate::message::CsiMessage) back.

pub mod client;
pub mod server;

use std::path::PathBuf;

pub use client::CsiClient;
pub use server::CsiServer;

use crate::error::CsiError;

/// Upper bound for a single encoded request or response.
pub const MAX_MESSAGE_BYTES: u64 = 4 * 1024 * 1024;

/// Resolve an endpoint such as `unix:///run/csi/csi.sock` or a plain path.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, CsiError> {
    let path = match endpoint.split_once("://") {
        Some(("unix", path)) => path,
        Some((scheme, _)) => {
            return Err(CsiError::invalid(format!(
                "unsupported endpoint scheme {scheme:?}, only unix sockets are served"
            )));
        }
        None => endpoint,
    };
    if path.is_empty() {
        return Err(CsiError::invalid("endpoint path is empty"));
    }
    Ok(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            parse_endpoint("unix:///run/csi/csi.sock").unwrap(),
            PathBuf::from("/run/csi/csi.sock")
        );
        assert_eq!(
            parse_endpoint("/tmp/csi.sock").unwrap(),
            PathBuf::from("/tmp/csi.sock")
        );
        assert!(parse_endpoint("tcp://127.0.0.1:10000").is_err());
        assert!(parse_endpoint("unix://").is_err());
    }
}
