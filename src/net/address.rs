//! Address specification parsing
//!
//! Grammar: `[<|>]? (scheme://)? (host:port | port)` with scheme one of
//! `udp`, `tcp` or `ws`. A leading `>` forces a client connection, a leading
//! `<` forces a bind. Without a direction a bare port binds and `host:port`
//! connects. A WebSocket address may end in a request path
//! (`ws://host:port/chat`).

use std::fmt;

use bitflags::bitflags;

use crate::error::AddressError;

/// Host used when connecting to a bare port
pub const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";

/// Host used when binding a bare port
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Request path when a WebSocket address names none
pub const DEFAULT_PATH: &str = "/";

bitflags! {
    /// Set of protocols a caller allows `open` to use
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protocols: u8 {
        const UDP = 1 << 0;
        const TCP = 1 << 1;
        const WEBSOCKET = 1 << 2;
        const ALL = Self::UDP.bits() | Self::TCP.bits() | Self::WEBSOCKET.bits();
    }
}

/// The single protocol a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    WebSocket,
}

impl Protocol {
    /// Scheme name
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::WebSocket => "ws",
        }
    }

    /// Flag of this protocol inside a [`Protocols`] mask
    pub fn flag(&self) -> Protocols {
        match self {
            Protocol::Udp => Protocols::UDP,
            Protocol::Tcp => Protocols::TCP,
            Protocol::WebSocket => Protocols::WEBSOCKET,
        }
    }

    /// Whether peers are tracked as connections (TCP and WebSocket)
    pub fn is_connection_oriented(&self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether a session connects out or binds and listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Connect,
    Bind,
}

/// Parsed address string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    /// Every protocol left active by the scheme and the caller's mask
    pub protocols: Protocols,
    /// The protocol the session will actually use
    pub protocol: Protocol,
    pub role: Role,
    pub host: String,
    pub port: u16,
    /// WebSocket request path, always starting with `/`
    pub path: String,
}

const SCHEMES: [(&str, Protocol); 3] = [
    ("udp://", Protocol::Udp),
    ("tcp://", Protocol::Tcp),
    ("ws://", Protocol::WebSocket),
];

impl AddressSpec {
    /// Parse an address against the protocols the caller allows
    pub fn parse(address: &str, allowed: Protocols) -> Result<Self, AddressError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let allowed = allowed & Protocols::ALL;
        if allowed.is_empty() {
            return Err(AddressError::NoProtocol);
        }

        let (direction, rest) = match address.as_bytes()[0] {
            b'>' => (Some(Role::Connect), &address[1..]),
            b'<' => (Some(Role::Bind), &address[1..]),
            _ => (None, address),
        };

        let (protocols, rest) = split_scheme(rest, allowed)?;
        let protocol = select_protocol(protocols);

        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, DEFAULT_PATH),
        };
        if authority.is_empty() {
            return Err(AddressError::Empty);
        }

        let (host, port) = split_host_port(authority)?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?;

        if let Some(host) = host {
            if host.is_empty() {
                return Err(AddressError::MissingHost(address.to_string()));
            }
        }

        let role = direction.unwrap_or(if host.is_some() {
            Role::Connect
        } else {
            Role::Bind
        });
        if role == Role::Connect && port == 0 {
            return Err(AddressError::ZeroPort);
        }

        let host = match (host, role) {
            (Some(host), _) => host.to_string(),
            (None, Role::Connect) => DEFAULT_CONNECT_HOST.to_string(),
            (None, Role::Bind) => DEFAULT_BIND_HOST.to_string(),
        };

        Ok(Self {
            protocols,
            protocol,
            role,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// `host:port`, with IPv6 hosts in brackets
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// What a transport connects to: the authority, plus the request path
    /// for WebSocket
    pub fn target(&self) -> String {
        match self.protocol {
            Protocol::WebSocket => format!("{}{}", self.authority(), self.path),
            _ => self.authority(),
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.role {
            Role::Connect => '>',
            Role::Bind => '<',
        };
        match self.protocol {
            Protocol::WebSocket if self.path != DEFAULT_PATH => {
                write!(f, "{}{}://{}", direction, self.protocol, self.target())
            }
            _ => write!(f, "{}{}://{}", direction, self.protocol, self.authority()),
        }
    }
}

fn split_scheme(rest: &str, allowed: Protocols) -> Result<(Protocols, &str), AddressError> {
    for (scheme, protocol) in SCHEMES {
        let matches = rest
            .get(..scheme.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .unwrap_or(false);
        if matches {
            if !allowed.contains(protocol.flag()) {
                return Err(AddressError::ProtocolNotAllowed(protocol.name()));
            }
            return Ok((protocol.flag(), &rest[scheme.len()..]));
        }
    }

    if allowed.contains(Protocols::WEBSOCKET) && allowed != Protocols::WEBSOCKET {
        return Err(AddressError::AmbiguousProtocol);
    }
    Ok((allowed, rest))
}

fn select_protocol(protocols: Protocols) -> Protocol {
    if protocols.contains(Protocols::TCP) {
        Protocol::Tcp
    } else if protocols.contains(Protocols::UDP) {
        Protocol::Udp
    } else {
        Protocol::WebSocket
    }
}

fn split_host_port(authority: &str) -> Result<(Option<&str>, &str), AddressError> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        return match bracketed.split_once("]:") {
            Some((host, port)) => Ok((Some(host), port)),
            None => Err(AddressError::InvalidPort(authority.to_string())),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => {
            Err(AddressError::InvalidPort(authority.to_string()))
        }
        Some((host, port)) => Ok((Some(host), port)),
        None => Ok((None, authority)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bare_port_binds() {
        let spec = AddressSpec::parse("5000", Protocols::TCP).unwrap();
        assert_eq!(spec.role, Role::Bind);
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.host, "0.0.0.0");
        assert_eq!(spec.port, 5000);
    }

    #[test]
    fn test_host_port_connects() {
        let spec = AddressSpec::parse("example.com:80", Protocols::TCP).unwrap();
        assert_eq!(spec.role, Role::Connect);
        assert_eq!(spec.host, "example.com");
        assert_eq!(spec.port, 80);
        assert_eq!(spec.authority(), "example.com:80");
    }

    #[test]
    fn test_direction_prefixes() {
        let spec = AddressSpec::parse(">5000", Protocols::TCP).unwrap();
        assert_eq!(spec.role, Role::Connect);
        assert_eq!(spec.host, "127.0.0.1");

        let spec = AddressSpec::parse("<127.0.0.1:5000", Protocols::TCP).unwrap();
        assert_eq!(spec.role, Role::Bind);
        assert_eq!(spec.host, "127.0.0.1");

        let spec = AddressSpec::parse("<5000", Protocols::TCP).unwrap();
        assert_eq!(spec.role, Role::Bind);
        assert_eq!(spec.host, "0.0.0.0");
    }

    #[test]
    fn test_scheme_restricts_protocol() {
        let spec = AddressSpec::parse("udp://127.0.0.1:9000", Protocols::ALL).unwrap();
        assert_eq!(spec.protocol, Protocol::Udp);
        assert_eq!(spec.protocols, Protocols::UDP);

        let spec = AddressSpec::parse(">WS://localhost:8080/chat", Protocols::ALL).unwrap();
        assert_eq!(spec.protocol, Protocol::WebSocket);
        assert_eq!(spec.host, "localhost");
        assert_eq!(spec.port, 8080);
    }

    #[test]
    fn test_websocket_path_kept() {
        let spec = AddressSpec::parse(">ws://localhost:8080/chat/room?id=1", Protocols::ALL)
            .unwrap();
        assert_eq!(spec.path, "/chat/room?id=1");
        assert_eq!(spec.authority(), "localhost:8080");
        assert_eq!(spec.target(), "localhost:8080/chat/room?id=1");
        assert_eq!(spec.to_string(), ">ws://localhost:8080/chat/room?id=1");

        let spec = AddressSpec::parse(">ws://localhost:8080", Protocols::WEBSOCKET).unwrap();
        assert_eq!(spec.path, "/");
        assert_eq!(spec.target(), "localhost:8080/");

        // Other protocols connect to the bare authority
        let spec = AddressSpec::parse("tcp://127.0.0.1:9000/ignored", Protocols::ALL).unwrap();
        assert_eq!(spec.target(), "127.0.0.1:9000");
    }

    #[test]
    fn test_scheme_outside_mask_fails() {
        let err = AddressSpec::parse("ws://127.0.0.1:80", Protocols::TCP).unwrap_err();
        assert_eq!(err, AddressError::ProtocolNotAllowed("ws"));

        let err = AddressSpec::parse("udp://5000", Protocols::TCP | Protocols::WEBSOCKET)
            .unwrap_err();
        assert_eq!(err, AddressError::ProtocolNotAllowed("udp"));
    }

    #[test]
    fn test_absent_scheme_keeps_mask() {
        let spec = AddressSpec::parse("5000", Protocols::UDP | Protocols::TCP).unwrap();
        assert_eq!(spec.protocols, Protocols::UDP | Protocols::TCP);
        assert_eq!(spec.protocol, Protocol::Tcp);

        let spec = AddressSpec::parse("5000", Protocols::UDP).unwrap();
        assert_eq!(spec.protocol, Protocol::Udp);

        let spec = AddressSpec::parse("5000", Protocols::WEBSOCKET).unwrap();
        assert_eq!(spec.protocol, Protocol::WebSocket);
    }

    #[test]
    fn test_websocket_never_combined() {
        let err = AddressSpec::parse("5000", Protocols::ALL).unwrap_err();
        assert_eq!(err, AddressError::AmbiguousProtocol);

        // An explicit scheme resolves the ambiguity
        assert!(AddressSpec::parse("tcp://5000", Protocols::ALL).is_ok());
    }

    #[test]
    fn test_malformed_ports_fail() {
        assert_eq!(
            AddressSpec::parse("localhost:http", Protocols::TCP).unwrap_err(),
            AddressError::InvalidPort("http".to_string())
        );
        assert_eq!(
            AddressSpec::parse("70000", Protocols::TCP).unwrap_err(),
            AddressError::InvalidPort("70000".to_string())
        );
        assert!(AddressSpec::parse("abc", Protocols::TCP).is_err());
    }

    #[test]
    fn test_port_zero() {
        let spec = AddressSpec::parse("<0", Protocols::TCP).unwrap();
        assert_eq!(spec.port, 0);

        assert_eq!(
            AddressSpec::parse(">127.0.0.1:0", Protocols::TCP).unwrap_err(),
            AddressError::ZeroPort
        );
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(
            AddressSpec::parse("", Protocols::TCP).unwrap_err(),
            AddressError::Empty
        );
        assert_eq!(
            AddressSpec::parse(">", Protocols::TCP).unwrap_err(),
            AddressError::Empty
        );
        assert_eq!(
            AddressSpec::parse("5000", Protocols::empty()).unwrap_err(),
            AddressError::NoProtocol
        );
        assert!(matches!(
            AddressSpec::parse(":5000", Protocols::TCP).unwrap_err(),
            AddressError::MissingHost(_)
        ));
    }

    #[test]
    fn test_ipv6() {
        let spec = AddressSpec::parse("[::1]:7000", Protocols::TCP).unwrap();
        assert_eq!(spec.host, "::1");
        assert_eq!(spec.role, Role::Connect);
        assert_eq!(spec.authority(), "[::1]:7000");

        assert!(AddressSpec::parse("::1:7000", Protocols::TCP).is_err());
    }

    #[test]
    fn test_parse_is_pure() {
        let a = AddressSpec::parse(">tcp://10.0.0.2:4000", Protocols::ALL).unwrap();
        let b = AddressSpec::parse(">tcp://10.0.0.2:4000", Protocols::ALL).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), ">tcp://10.0.0.2:4000");
    }
}
