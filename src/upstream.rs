use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use crate::error::ValidationError;

/// Wire protocol an upstream resolver is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetProtocol {
    /// Classic DNS: UDP with TCP retry on truncation or failure.
    TcpUdp,
    /// DNS over TLS (RFC 7858).
    TcpTls,
    /// DNS over HTTPS (RFC 8484).
    Https,
}

impl NetProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            NetProtocol::TcpUdp => 53,
            NetProtocol::TcpTls => 853,
            NetProtocol::Https => 443,
        }
    }
}

impl fmt::Display for NetProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetProtocol::TcpUdp => "tcp+udp",
            NetProtocol::TcpTls => "tcp-tls",
            NetProtocol::Https => "https",
        };
        f.write_str(s)
    }
}

/// Parsed upstream endpoint. Immutable once validated; the parser is the only
/// constructor, so a `path` is only ever present on HTTPS endpoints and the
/// port is always in range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub net: NetProtocol,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Upstream {
    /// Host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// URL for HTTPS endpoints; `/dns-query` when no path was given.
    pub fn url(&self) -> String {
        let path = if self.path.is_empty() {
            "/dns-query"
        } else {
            &self.path
        };
        format!("https://{}:{}{}", bracketed(&self.host), self.port, path)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.net == NetProtocol::Https && !self.path.is_empty() {
            write!(
                f,
                "https://{}:{}{}",
                bracketed(&self.host),
                self.port,
                self.path
            )
        } else {
            write!(f, "{}:{}:{}", self.net, bracketed(&self.host), self.port)
        }
    }
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

impl FromStr for Upstream {
    type Err = ValidationError;

    /// Grammar: optional net prefix (`tcp+udp` | `tcp-tls` | `tcp` | `udp` |
    /// `https`), then host (bracketed IPv6, bare IPv6, IPv4 or hostname),
    /// optional `:port`. A path is only accepted through the full
    /// `https://host[:port]/path` form.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() {
            return Err(invalid(text, "empty upstream"));
        }

        if let Some(rest) = text.strip_prefix("https://") {
            return parse_url_form(text, rest);
        }

        let (net, rest) = split_net_prefix(text);
        let (host, port) = parse_host_port(text, rest, net)?;
        Ok(Upstream {
            net,
            host,
            port,
            path: String::new(),
        })
    }
}

fn invalid(input: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Upstream {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn split_net_prefix(text: &str) -> (NetProtocol, &str) {
    const PREFIXES: [(&str, NetProtocol); 5] = [
        ("tcp+udp:", NetProtocol::TcpUdp),
        ("tcp-tls:", NetProtocol::TcpTls),
        ("tcp:", NetProtocol::TcpUdp),
        ("udp:", NetProtocol::TcpUdp),
        ("https:", NetProtocol::Https),
    ];
    for (prefix, net) in PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            return (net, rest);
        }
    }
    (NetProtocol::TcpUdp, text)
}

/// `https://host[:port][/path]`.
fn parse_url_form(input: &str, rest: &str) -> Result<Upstream, ValidationError> {
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, String::new()),
    };
    let (host, port) = parse_host_port(input, host_port, NetProtocol::Https)?;
    Ok(Upstream {
        net: NetProtocol::Https,
        host,
        port,
        path,
    })
}

fn parse_host_port(
    input: &str,
    rest: &str,
    net: NetProtocol,
) -> Result<(String, u16), ValidationError> {
    if rest.is_empty() {
        return Err(invalid(input, "missing host"));
    }

    // Bracketed IPv6 literal.
    if let Some(v6) = rest.strip_prefix('[') {
        let Some(end) = v6.find(']') else {
            return Err(invalid(input, "unterminated IPv6 literal"));
        };
        let host = &v6[..end];
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(invalid(input, format!("'{host}' is not an IPv6 address")));
        }
        let port = match &v6[end + 1..] {
            "" => net.default_port(),
            tail => match tail.strip_prefix(':') {
                Some(p) => parse_port(input, p)?,
                None => return Err(invalid(input, "garbage after IPv6 literal")),
            },
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 literal carries colons of its own and never a port.
    if rest.parse::<Ipv6Addr>().is_ok() {
        return Ok((rest.to_string(), net.default_port()));
    }

    let (host, port) = match rest.rfind(':') {
        Some(idx) => (&rest[..idx], parse_port(input, &rest[idx + 1..])?),
        None => (rest, net.default_port()),
    };

    if host.is_empty() {
        return Err(invalid(input, "missing host"));
    }
    if let Some(idx) = host.find(':') {
        // More than one colon but not an IPv6 literal: the first token is
        // either an unknown net prefix or line noise.
        let token = &host[..idx];
        if token.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
            return Err(invalid(input, format!("unknown net protocol '{token}'")));
        }
        return Err(invalid(input, format!("'{host}' is not a valid host")));
    }
    if host.parse::<IpAddr>().is_err() {
        if let Some(bad) = host
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
        {
            return Err(invalid(input, format!("invalid hostname character '{bad}'")));
        }
    }
    Ok((host.to_ascii_lowercase(), port))
}

fn parse_port(input: &str, text: &str) -> Result<u16, ValidationError> {
    match text.parse::<i64>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
        Ok(p) => Err(invalid(input, format!("port {p} out of range"))),
        Err(_) => Err(invalid(input, format!("port '{text}' is not a number"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Upstream {
        s.parse().unwrap_or_else(|e| panic!("parse {s}: {e}"))
    }

    #[test]
    fn plain_ipv4_uses_udp_tcp_and_default_port() {
        let u = parse("4.4.4.4");
        assert_eq!(u.net, NetProtocol::TcpUdp);
        assert_eq!(u.host, "4.4.4.4");
        assert_eq!(u.port, 53);
        assert_eq!(u.path, "");
    }

    #[test]
    fn explicit_ports_are_honored() {
        assert_eq!(parse("4.4.4.4:531").port, 531);
        assert_eq!(parse("1.1.1.1:153").port, 153);
        assert_eq!(parse("tcp+udp:4.4.4.4:4711").port, 4711);
    }

    #[test]
    fn tcp_tls_defaults_to_853() {
        let u = parse("tcp-tls:4.4.4.4");
        assert_eq!(u.net, NetProtocol::TcpTls);
        assert_eq!(u.port, 853);
    }

    #[test]
    fn doh_short_form_defaults_to_443() {
        let u = parse("https:4.4.4.4");
        assert_eq!(u.net, NetProtocol::Https);
        assert_eq!(u.host, "4.4.4.4");
        assert_eq!(u.port, 443);
        assert_eq!(u.path, "");

        assert_eq!(parse("https:4.4.4.4:888").port, 888);
    }

    #[test]
    fn doh_url_form_keeps_path() {
        let u = parse("https://dns.google/dns-query");
        assert_eq!(u.net, NetProtocol::Https);
        assert_eq!(u.host, "dns.google");
        assert_eq!(u.port, 443);
        assert_eq!(u.path, "/dns-query");

        let u = parse("https://dns.google/dns-query/a/b");
        assert_eq!(u.path, "/dns-query/a/b");

        let u = parse("https://dns.google:888/dns-query");
        assert_eq!(u.port, 888);
        assert_eq!(u.path, "/dns-query");
    }

    #[test]
    fn ipv6_literals() {
        let u = parse("tcp+udp:[fd00::6cd4:d7e0:d99d:2952]:53");
        assert_eq!(u.host, "fd00::6cd4:d7e0:d99d:2952");
        assert_eq!(u.port, 53);

        let u = parse("[2001:4860:4860::8888]:53");
        assert_eq!(u.net, NetProtocol::TcpUdp);
        assert_eq!(u.host, "2001:4860:4860::8888");

        let u = parse("[2620:fe::9]:55");
        assert_eq!(u.host, "2620:fe::9");
        assert_eq!(u.port, 55);
    }

    #[test]
    fn bare_ipv6_takes_default_port() {
        assert_eq!(parse("2620:fe::fe").port, 53);
        assert_eq!(parse("2620:fe::9").host, "2620:fe::9");
    }

    #[test]
    fn rejects_bad_input() {
        for bad in [
            "",
            "tcp:4.4.4.4:-1",
            "tcp:4.4.4.4:65536",
            "tcp:4.4.4.4:A636",
            "bla:4.4.4.4:53",
            "host$name",
            "[2001:db8::1",
        ] {
            assert!(bad.parse::<Upstream>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn unknown_prefix_is_reported_as_protocol_error() {
        let err = "bla:4.4.4.4:53".parse::<Upstream>().unwrap_err();
        assert!(err.to_string().contains("unknown net protocol 'bla'"), "{err}");
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(parse("4.4.4.4").to_string(), "tcp+udp:4.4.4.4:53");
        assert_eq!(parse("tcp-tls:1.1.1.1").to_string(), "tcp-tls:1.1.1.1:853");
        assert_eq!(
            parse("https://dns.google/dns-query").to_string(),
            "https://dns.google:443/dns-query"
        );
        assert_eq!(
            parse("[2620:fe::9]:55").to_string(),
            "tcp+udp:[2620:fe::9]:55"
        );
    }

    #[test]
    fn doh_url_builder_falls_back_to_dns_query() {
        assert_eq!(parse("https:9.9.9.9").url(), "https://9.9.9.9:443/dns-query");
        assert_eq!(
            parse("https://dns.google/custom").url(),
            "https://dns.google:443/custom"
        );
    }
}
