//! Parser for plain-text proxy lists

use crate::proxy::models::{Anonymity, Protocol, ProxyRecord, UNKNOWN_COUNTRY};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

/// `[scheme://]ip:port` on a line of its own
static LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(https?|socks[45])://)?(\d{1,3}(?:\.\d{1,3}){3}):(\d{1,5})/?$")
        .expect("Invalid proxy line regex")
});

/// `ip:port` anywhere in free text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3}):(\d{1,5})\b").expect("Invalid IP:PORT regex")
});

/// Parser turning proxy lists into never-checked records
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT (protocol taken from `default_protocol`)
    /// - scheme://IP:PORT
    pub fn parse_line(line: &str, default_protocol: Protocol) -> Option<ProxyRecord> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let caps = LINE_REGEX.captures(line)?;
        let protocol = match caps.get(1) {
            Some(scheme) => scheme.as_str().parse().ok()?,
            None => default_protocol,
        };

        Self::build(&caps[2], &caps[3], protocol)
    }

    /// Parse proxies from a string (multiple lines)
    ///
    /// Falls back to scanning for `ip:port` pairs anywhere in the text when no line
    /// parses on its own.
    pub fn parse_string(content: &str, default_protocol: Protocol) -> Vec<ProxyRecord> {
        let proxies: Vec<ProxyRecord> = content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_protocol))
            .collect();

        if !proxies.is_empty() {
            return proxies;
        }

        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| Self::build(&cap[1], &cap[2], default_protocol))
            .collect()
    }

    fn build(ip: &str, port: &str, protocol: Protocol) -> Option<ProxyRecord> {
        let ip: Ipv4Addr = ip.parse().ok()?;
        let port: u16 = port.parse().ok()?;
        if port == 0 {
            return None;
        }
        ProxyRecord::with_protocols(ip, port, vec![protocol], UNKNOWN_COUNTRY, Anonymity::Unknown)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_format() {
        let proxy = ProxyParser::parse_line("192.168.1.1:8080", Protocol::Http).unwrap();
        assert_eq!(proxy.ip(), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(proxy.port(), 8080);
        assert_eq!(proxy.protocols(), &[Protocol::Http]);
        assert_eq!(proxy.country(), UNKNOWN_COUNTRY);
        assert_eq!(proxy.anonymity(), Anonymity::Unknown);
    }

    #[test]
    fn test_parse_url_format_overrides_default() {
        let proxy = ProxyParser::parse_line("socks5://192.168.1.1:1080", Protocol::Http).unwrap();
        assert_eq!(proxy.port(), 1080);
        assert_eq!(proxy.protocols(), &[Protocol::Socks5]);
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        assert!(ProxyParser::parse_line("", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("# This is a comment", Protocol::Http).is_none());
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(ProxyParser::parse_line("invalid", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("192.168.1.1", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("192.168.1.1:abc", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("999.1.1.1:8080", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("1.1.1.1:0", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("1.1.1.1:70000", Protocol::Http).is_none());
        assert!(ProxyParser::parse_line("ftp://1.1.1.1:21", Protocol::Http).is_none());
    }

    #[test]
    fn test_parse_string() {
        let content = r#"
192.168.1.1:8080
# This is a comment
http://192.168.1.3:8080
socks4://10.0.0.1:1080
"#;
        let proxies = ProxyParser::parse_string(content, Protocol::Socks5);
        assert_eq!(proxies.len(), 3);
        assert_eq!(proxies[0].protocols(), &[Protocol::Socks5]);
        assert_eq!(proxies[2].protocols(), &[Protocol::Socks4]);
    }

    #[test]
    fn test_parse_string_falls_back_to_embedded_pairs() {
        let content = "Here is a proxy: 192.168.1.1:8080 and another one 10.0.0.1:3128.";
        let proxies = ProxyParser::parse_string(content, Protocol::Http);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1].to_simple_string(), "10.0.0.1:3128");
    }
}
