// SPDX-License-Identifier: Apache-2.0

use crate::listener::Endpoint;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("endpoint is empty")]
    Empty,

    #[error("missing port in `{0}`")]
    MissingPort(String),

    #[error("invalid port in `{0}`")]
    InvalidPort(String),

    #[error("invalid host in `{0}`")]
    InvalidHost(String),
}

/// Parse an endpoint of the form `host:port`, `[v6addr]:port`, `:port` or an
/// absolute socket path.
pub fn parse_endpoint(s: &str) -> Result<Endpoint, EndpointParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EndpointParseError::Empty);
    }

    if s.starts_with('/') {
        return Ok(Endpoint::Unix(PathBuf::from(s)));
    }

    let (host, port) = match s.strip_prefix('[') {
        Some(rest) => {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(EndpointParseError::InvalidHost(s.to_string()));
            }
            (host, port)
        }
        None => {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;
            // bare IPv6 must be bracketed
            if host.contains(':') || !host.chars().all(valid_host_char) {
                return Err(EndpointParseError::InvalidHost(s.to_string()));
            }
            (host, port)
        }
    };

    let port: u16 = port
        .parse()
        .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;

    // Use actual localhost address instead of localhost name
    let host = match host {
        "" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        h => h,
    };

    Ok(Endpoint::tcp(host, port))
}

fn valid_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'
}
