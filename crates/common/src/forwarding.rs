// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

//! Forwarding rule parsing and validation
//!
//! Two rule shapes are understood:
//!
//! * base forwarding, `remotePort:localDomain:localPort` (e.g. `0:localhost:3000`)
//! * additional forwarding, `remoteDomain:remotePort:localDomain:localPort`, where the
//!   domain segment may carry a protocol prefix and a port suffix
//!   (e.g. `tcp//example.com/5555:0:localhost:6666`)
//!
//! Bracketed IPv6 literals (`[::1]`) are kept whole while splitting and unwrapped
//! in the parsed result.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::{format_host_port, split_colon_segments, unwrap_brackets};

const DEFAULT_LOCAL_DOMAIN: &str = "localhost";

static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$")
        .expect("domain pattern is valid")
});

/// Tunnel protocol
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
    Udp,
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Tls => "tls",
        }
    }

    /// Whether the broker assigns the remote port itself
    pub fn auto_assigns_port(&self) -> bool {
        matches!(self, Protocol::Http)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tls" => Ok(Protocol::Tls),
            _ => Err(Error::InvalidProtocol(s.to_string())),
        }
    }
}

/// Base forwarding rule: `remotePort:localDomain:localPort`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseForwarding {
    pub remote_port: u16,
    pub local_domain: String,
    pub local_port: u16,
}

impl BaseForwarding {
    pub fn parse(input: &str) -> Result<Self> {
        let parts = segments(input)?;
        if parts.len() != 3 {
            return Err(Error::InvalidForwarding(format!(
                "'{}' must have the form remotePort:localDomain:localPort",
                input
            )));
        }

        let remote_port = parse_remote_port(parts[0]).ok_or_else(|| {
            Error::InvalidForwarding(format!("remote port '{}' is not a number", parts[0]))
        })?;

        Ok(Self {
            remote_port,
            local_domain: local_domain(parts[1]),
            local_port: parse_local_port(parts[2])?,
        })
    }

    /// Local target in `host:port` form
    pub fn target(&self) -> String {
        format_host_port(&self.local_domain, self.local_port)
    }
}

impl fmt::Display for BaseForwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote_port, self.target())
    }
}

/// Additional forwarding rule as written by the user
///
/// The remote port is kept as given; [`AdditionalForwarding::resolve`] applies the
/// protocol defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdditionalForwarding {
    /// Explicit protocol prefix, `None` when the rule had none
    pub protocol: Option<Protocol>,
    pub remote_domain: Option<String>,
    pub remote_port: u16,
    pub local_domain: String,
    pub local_port: u16,
}

impl AdditionalForwarding {
    pub fn parse(input: &str) -> Result<Self> {
        let parts = segments(input)?;
        if parts.len() != 4 {
            return Err(Error::InvalidForwarding(format!(
                "'{}' must have the form remoteDomain:remotePort:localDomain:localPort",
                input
            )));
        }

        // [protocol//]domain[/port]
        let (protocol, remote) = match parts[0].split_once("//") {
            Some((proto, rest)) => (Some(proto.parse::<Protocol>()?), rest),
            None => (None, parts[0]),
        };
        let (domain, port_suffix) = match remote.rsplit_once('/') {
            Some((domain, port)) => (domain, Some(port)),
            None => (remote, None),
        };

        let domain = unwrap_brackets(domain.trim());
        let remote_domain = if domain.is_empty() {
            None
        } else if DOMAIN_PATTERN.is_match(domain) {
            Some(domain.to_ascii_lowercase())
        } else {
            return Err(Error::InvalidDomain(domain.to_string()));
        };

        let effective = protocol.unwrap_or_default();
        let port_text = port_suffix.unwrap_or(parts[1]);
        let remote_port = if effective.auto_assigns_port() {
            // Broker assigns http ports; whatever was written is only informational
            parse_remote_port(port_text).unwrap_or(0)
        } else {
            match parse_remote_port(port_text) {
                Some(port) if port > 0 => port,
                _ => return Err(Error::PortRequired(effective.to_string())),
            }
        };

        Ok(Self {
            protocol,
            remote_domain,
            remote_port,
            local_domain: local_domain(parts[2]),
            local_port: parse_local_port(parts[3])?,
        })
    }

    /// Apply protocol defaults: http when unspecified, remote port 0 for http
    pub fn resolve(&self) -> ResolvedForwarding {
        let protocol = self.protocol.unwrap_or_default();
        let remote_port = if protocol.auto_assigns_port() {
            0
        } else {
            self.remote_port
        };

        ResolvedForwarding {
            protocol,
            remote_domain: self.remote_domain.clone(),
            remote_port,
            local_domain: self.local_domain.clone(),
            local_port: self.local_port,
        }
    }
}

/// Additional forwarding rule ready to be submitted to the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedForwarding {
    pub protocol: Protocol,
    pub remote_domain: Option<String>,
    pub remote_port: u16,
    pub local_domain: String,
    pub local_port: u16,
}

impl ResolvedForwarding {
    /// Remote side as understood by the engine: `domain:port`, or the bare port
    pub fn hostname(&self) -> String {
        match &self.remote_domain {
            Some(domain) => format!("{}:{}", domain, self.remote_port),
            None => self.remote_port.to_string(),
        }
    }

    /// Local side in `host:port` form
    pub fn target(&self) -> String {
        format_host_port(&self.local_domain, self.local_port)
    }
}

/// Outcome of applying one additional forwarding rule to a live tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardingOutcome {
    /// Rule as configured
    pub rule: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub target: String,
    /// Failure reason, `None` when the engine accepted the rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForwardingOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Either kind of rule, chosen by segment count
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingRule {
    Base(BaseForwarding),
    Additional(AdditionalForwarding),
}

impl FromStr for ForwardingRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match segments(s)?.len() {
            3 => BaseForwarding::parse(s).map(ForwardingRule::Base),
            4 => AdditionalForwarding::parse(s).map(ForwardingRule::Additional),
            n => Err(Error::InvalidForwarding(format!(
                "'{}' has {} segments, expected 3 or 4",
                s, n
            ))),
        }
    }
}

fn segments(input: &str) -> Result<Vec<&str>> {
    split_colon_segments(input.trim())
        .ok_or_else(|| Error::InvalidForwarding(format!("unbalanced brackets in '{}'", input)))
}

fn parse_remote_port(text: &str) -> Option<u16> {
    let text = text.trim();
    if text.is_empty() {
        return Some(0);
    }
    text.parse::<u16>().ok()
}

fn parse_local_port(text: &str) -> Result<u16> {
    match text.trim().parse::<u32>() {
        Ok(port) if port > 0 && port < 65536 => Ok(port as u16),
        _ => Err(Error::InvalidLocalPort(text.to_string())),
    }
}

fn local_domain(text: &str) -> String {
    let domain = unwrap_brackets(text.trim());
    if domain.is_empty() {
        DEFAULT_LOCAL_DOMAIN.to_string()
    } else {
        domain.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base_forwarding() {
        let rule = BaseForwarding::parse("5555:localhost:6666").unwrap();
        assert_eq!(rule.remote_port, 5555);
        assert_eq!(rule.local_domain, "localhost");
        assert_eq!(rule.local_port, 6666);
        assert_eq!(rule.target(), "localhost:6666");
    }

    #[test]
    fn test_base_forwarding_defaults_local_domain() {
        let rule = BaseForwarding::parse("0::3000").unwrap();
        assert_eq!(rule.local_domain, "localhost");
        assert_eq!(rule.remote_port, 0);
    }

    #[test]
    fn test_base_forwarding_ipv6_target() {
        let rule = BaseForwarding::parse("0:[::1]:3000").unwrap();
        assert_eq!(rule.local_domain, "::1");
        assert_eq!(rule.target(), "[::1]:3000");
    }

    #[test]
    fn test_parse_additional_with_ipv6_local() {
        let rule = AdditionalForwarding::parse("example.com:7777:[::1]:8080").unwrap();
        assert_eq!(rule.protocol, None);
        assert_eq!(rule.remote_domain.as_deref(), Some("example.com"));
        assert_eq!(rule.remote_port, 7777);
        assert_eq!(rule.local_domain, "::1");
        assert_eq!(rule.local_port, 8080);
    }

    #[test]
    fn test_parse_additional_with_protocol_and_port_suffix() {
        let rule = AdditionalForwarding::parse("tcp//example.com/5555:0:localhost:6666").unwrap();
        assert_eq!(rule.protocol, Some(Protocol::Tcp));
        assert_eq!(rule.remote_domain.as_deref(), Some("example.com"));
        assert_eq!(rule.remote_port, 5555);
        assert_eq!(rule.local_domain, "localhost");
        assert_eq!(rule.local_port, 6666);

        let resolved = rule.resolve();
        assert_eq!(resolved.hostname(), "example.com:5555");
        assert_eq!(resolved.target(), "localhost:6666");
    }

    #[test]
    fn test_http_resolves_to_port_zero() {
        for input in [
            "example.com:7777:localhost:80",
            "http//example.com/9000:1234:localhost:80",
            "http//example.com:4444:localhost:80",
        ] {
            let resolved = AdditionalForwarding::parse(input).unwrap().resolve();
            assert_eq!(resolved.protocol, Protocol::Http, "{input}");
            assert_eq!(resolved.remote_port, 0, "{input}");
        }
    }

    #[test]
    fn test_port_required_for_tcp_udp_tls() {
        for proto in ["tcp", "udp", "tls"] {
            let input = format!("{proto}//example.com:0:localhost:80");
            assert!(matches!(
                AdditionalForwarding::parse(&input),
                Err(Error::PortRequired(_))
            ));
        }
        let rule = AdditionalForwarding::parse("udp//example.com:53:localhost:5353").unwrap();
        assert_eq!(rule.resolve().remote_port, 53);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        assert!(matches!(
            AdditionalForwarding::parse("ftp//example.com/21:0:localhost:21"),
            Err(Error::InvalidProtocol(_))
        ));
    }

    #[test]
    fn test_invalid_domain_rejected() {
        assert!(matches!(
            AdditionalForwarding::parse("not_a_domain!:0:localhost:80"),
            Err(Error::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_missing_domain_uses_bare_port() {
        let rule = AdditionalForwarding::parse("tcp//:4000:localhost:22").unwrap();
        assert_eq!(rule.remote_domain, None);
        assert_eq!(rule.resolve().hostname(), "4000");
    }

    #[test]
    fn test_invalid_local_port() {
        for input in ["0:localhost:0", "0:localhost:65536", "0:localhost:abc"] {
            assert!(matches!(
                BaseForwarding::parse(input),
                Err(Error::InvalidLocalPort(_))
            ));
        }
    }

    #[test]
    fn test_malformed_rules_fail() {
        assert!("localhost:8080".parse::<ForwardingRule>().is_err());
        assert!("a:b:c:d:e".parse::<ForwardingRule>().is_err());
        assert!("x:localhost:80".parse::<ForwardingRule>().is_err());
        assert!("0:[::1:80".parse::<ForwardingRule>().is_err());
    }

    #[test]
    fn test_rule_dispatch_by_segment_count() {
        assert!(matches!(
            "0:localhost:3000".parse::<ForwardingRule>().unwrap(),
            ForwardingRule::Base(_)
        ));
        assert!(matches!(
            "example.com:0:localhost:3000".parse::<ForwardingRule>().unwrap(),
            ForwardingRule::Additional(_)
        ));
    }
}
