// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// Network utility functions

use std::net::{IpAddr, Ipv6Addr};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    let host = unwrap_brackets(host);

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts are treated as non-loopback
    false
}

/// Strip the brackets of an IPv6 literal (`[::1]` -> `::1`)
pub fn unwrap_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Join host and port, bracketing IPv6 literals (`::1`, 80 -> `[::1]:80`)
pub fn format_host_port(host: &str, port: u16) -> String {
    let host = unwrap_brackets(host);
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split a `:`-separated string, keeping `[...]` segments intact
///
/// `example.com:7777:[::1]:8080` -> `["example.com", "7777", "[::1]", "8080"]`.
/// Returns `None` when a bracket is left unbalanced.
pub fn split_colon_segments(input: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_brackets = false;

    for (idx, ch) in input.char_indices() {
        match ch {
            '[' if !in_brackets => in_brackets = true,
            '[' => return None,
            ']' if in_brackets => in_brackets = false,
            ']' => return None,
            ':' if !in_brackets => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }

    if in_brackets {
        return None;
    }
    parts.push(&input[start..]);
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.255.255.255"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("[::1]"));
        assert!(is_loopback_address("LocalHost"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("192.168.1.1"));
        assert!(!is_loopback_address("example.com"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("localhost", 3000), "localhost:3000");
        assert_eq!(format_host_port("::1", 8080), "[::1]:8080");
        assert_eq!(format_host_port("[::1]", 8080), "[::1]:8080");
        assert_eq!(format_host_port("10.0.0.1", 22), "10.0.0.1:22");
    }

    #[test]
    fn test_split_colon_segments() {
        assert_eq!(
            split_colon_segments("example.com:7777:[::1]:8080").unwrap(),
            vec!["example.com", "7777", "[::1]", "8080"]
        );
        assert_eq!(
            split_colon_segments("0::3000").unwrap(),
            vec!["0", "", "3000"]
        );
        assert_eq!(split_colon_segments("[fe80::1]").unwrap(), vec!["[fe80::1]"]);
        assert!(split_colon_segments("[::1:80").is_none());
        assert!(split_colon_segments("::1]:80").is_none());
    }
}
