//! Address Parsing
//!
//! This module provides the small address form used by the container:
//! `scheme://host[:port][/address]`. The scheme and port are optional; the
//! default scheme is `amqp` and the default port is 5672.

use crate::error::{AmqpError, AmqpResult};
use std::str::FromStr;

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// A parsed AMQP address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpAddress {
    /// `amqp` or `amqps`
    pub scheme: String,
    /// Hostname or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Optional node address (the path component)
    pub address: Option<String>,
}

impl AmqpAddress {
    /// The `host:port` form used for connecting and binding
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for AmqpAddress {
    type Err = AmqpError;

    fn from_str(input: &str) -> AmqpResult<Self> {
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => {
                if scheme != "amqp" && scheme != "amqps" {
                    return Err(AmqpError::address(format!("unknown scheme {:?}", scheme)));
                }
                (scheme.to_string(), rest)
            }
            None => ("amqp".to_string(), input),
        };

        let (authority, address) = match rest.split_once('/') {
            Some((authority, path)) if !path.is_empty() => (authority, Some(path.to_string())),
            Some((authority, _)) => (authority, None),
            None => (rest, None),
        };

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // IPv6 literal
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AmqpError::address("unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(AmqpError::address("junk after IPv6 literal")),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(port)?),
                None => (authority.to_string(), DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(AmqpError::address("missing host"));
        }

        Ok(AmqpAddress {
            scheme,
            host,
            port,
            address,
        })
    }
}

fn parse_port(port: &str) -> AmqpResult<u16> {
    port.parse::<u16>()
        .map_err(|_| AmqpError::address(format!("invalid port {:?}", port)))
}

impl std::fmt::Display for AmqpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host_port())?;
        if let Some(address) = &self.address {
            write!(f, "/{}", address)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_form() {
        let addr: AmqpAddress = "amqp://broker.example.com:5673/queue-a".parse().unwrap();
        assert_eq!(addr.scheme, "amqp");
        assert_eq!(addr.host, "broker.example.com");
        assert_eq!(addr.port, 5673);
        assert_eq!(addr.address.as_deref(), Some("queue-a"));
    }

    #[test]
    fn test_defaults() {
        let addr: AmqpAddress = "localhost".parse().unwrap();
        assert_eq!(addr.scheme, "amqp");
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.address, None);
        assert_eq!(addr.host_port(), "localhost:5672");
    }

    #[test]
    fn test_bare_host_port() {
        let addr: AmqpAddress = "127.0.0.1:1".parse().unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 1);
    }

    #[test]
    fn test_amqps_scheme() {
        let addr: AmqpAddress = "amqps://secure.example.com".parse().unwrap();
        assert_eq!(addr.scheme, "amqps");
        assert_eq!(addr.port, DEFAULT_PORT);
    }

    #[test]
    fn test_ipv6_literal() {
        let addr: AmqpAddress = "amqp://[::1]:5673".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 5673);
        assert_eq!(addr.host_port(), "[::1]:5673");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!("http://nope".parse::<AmqpAddress>().is_err());
        assert!("host:notaport".parse::<AmqpAddress>().is_err());
        assert!(":5672".parse::<AmqpAddress>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let addr: AmqpAddress = "amqp://h:1234/q".parse().unwrap();
        assert_eq!(addr.to_string(), "amqp://h:1234/q");
    }
}
