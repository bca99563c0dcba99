//! Stream tokens.
//!
//! A token names one logical stream on the server and, optionally, the
//! endpoint it is served from. Tokens announced by the server may leave the
//! address unset; the subscription registry fills it in from its fallback
//! address before connecting.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use bytes::{Buf, BufMut};

use crate::error::{StreamError, StreamResult};

/// Unique identifier of a stream, stable for the stream's lifetime
pub type StreamId = u32;

/// Size of the binary token form sent by the server
pub const TOKEN_WIRE_SIZE: usize = 24;

const ADDRESS_NOT_SET: u8 = 0;
const ADDRESS_V4: u8 = 1;
const ADDRESS_V6: u8 = 2;

/// Transport protocol a stream is served over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    NotSet,
    Tcp,
    Udp,
}

impl Protocol {
    const fn to_wire(self) -> u8 {
        match self {
            Self::NotSet => 0,
            Self::Tcp => 1,
            Self::Udp => 2,
        }
    }

    fn from_wire(value: u8) -> StreamResult<Self> {
        match value {
            0 => Ok(Self::NotSet),
            1 => Ok(Self::Tcp),
            2 => Ok(Self::Udp),
            other => Err(StreamError::InvalidToken(format!("unknown protocol {other}"))),
        }
    }
}

/// Identifier + optional endpoint of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamToken {
    stream_id: StreamId,
    port: u16,
    protocol: Protocol,
    address: Option<IpAddr>,
}

impl StreamToken {
    /// TCP token with a port but no address; the registry's fallback
    /// address is applied on subscribe.
    #[must_use]
    pub const fn new(stream_id: StreamId, port: u16) -> Self {
        Self {
            stream_id,
            port,
            protocol: Protocol::Tcp,
            address: None,
        }
    }

    /// TCP token bound to an explicit endpoint
    #[must_use]
    pub const fn from_endpoint(stream_id: StreamId, endpoint: SocketAddr) -> Self {
        Self {
            stream_id,
            port: endpoint.port(),
            protocol: Protocol::Tcp,
            address: Some(endpoint.ip()),
        }
    }

    /// TCP token from a textual address.
    ///
    /// Accepts "ip", "ip:port", "[v6]:port", "hostname" or "hostname:port";
    /// `default_port` is used when the text has none. Hostnames are resolved
    /// with the system resolver, which blocks.
    pub fn resolve(stream_id: StreamId, host: &str, default_port: u16) -> StreamResult<Self> {
        let endpoint = resolve_endpoint(host, default_port)?;
        Ok(Self::from_endpoint(stream_id, endpoint))
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub const fn address(&self) -> Option<IpAddr> {
        self.address
    }

    #[must_use]
    pub const fn has_address(&self) -> bool {
        self.address.is_some()
    }

    pub fn set_address(&mut self, address: IpAddr) {
        self.address = Some(address);
    }

    /// Endpoint to connect to, if an address is set
    #[must_use]
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// A token can be connected once both address and protocol are known
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.address.is_some() && !matches!(self.protocol, Protocol::NotSet)
    }

    /// Encode into the server's 24-byte token layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TOKEN_WIRE_SIZE] {
        let mut out = [0u8; TOKEN_WIRE_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.stream_id);
        buf.put_u16_le(self.port);
        buf.put_u8(self.protocol.to_wire());
        match self.address {
            None => {
                buf.put_u8(ADDRESS_NOT_SET);
                buf.put_bytes(0, 16);
            }
            Some(IpAddr::V4(v4)) => {
                buf.put_u8(ADDRESS_V4);
                buf.put_slice(&v4.octets());
                buf.put_bytes(0, 12);
            }
            Some(IpAddr::V6(v6)) => {
                buf.put_u8(ADDRESS_V6);
                buf.put_slice(&v6.octets());
            }
        }
        out
    }

    /// Decode the server's 24-byte token layout
    pub fn from_bytes(bytes: &[u8]) -> StreamResult<Self> {
        if bytes.len() != TOKEN_WIRE_SIZE {
            return Err(StreamError::InvalidToken(format!(
                "expected {TOKEN_WIRE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let stream_id = buf.get_u32_le();
        let port = buf.get_u16_le();
        let protocol = Protocol::from_wire(buf.get_u8())?;
        let address_type = buf.get_u8();
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);

        let address = match address_type {
            ADDRESS_NOT_SET => None,
            ADDRESS_V4 => Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
            ADDRESS_V6 => Some(IpAddr::V6(Ipv6Addr::from(raw))),
            other => {
                return Err(StreamError::InvalidToken(format!("unknown address type {other}")));
            }
        };

        Ok(Self {
            stream_id,
            port,
            protocol,
            address,
        })
    }
}

/// "7", "7@:2001", "7@10.0.0.2:2001", "7@[::1]:2001"
impl FromStr for StreamToken {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, rest) = match s.split_once('@') {
            Some((id, rest)) => (id, Some(rest)),
            None => (s, None),
        };

        let stream_id = id
            .trim()
            .parse::<StreamId>()
            .map_err(|e| StreamError::InvalidToken(format!("bad stream id '{id}': {e}")))?;

        match rest {
            None => Ok(Self::new(stream_id, 0)),
            Some(port) if port.starts_with(':') => {
                let port = port[1..]
                    .parse::<u16>()
                    .map_err(|e| StreamError::InvalidToken(format!("bad port in '{s}': {e}")))?;
                Ok(Self::new(stream_id, port))
            }
            Some(endpoint) => {
                let endpoint = endpoint
                    .parse::<SocketAddr>()
                    .map_err(|e| StreamError::InvalidAddress(format!("{endpoint}: {e}")))?;
                Ok(Self::from_endpoint(stream_id, endpoint))
            }
        }
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.endpoint(), self.port) {
            (Some(endpoint), _) => write!(f, "{}@{endpoint}", self.stream_id),
            (None, 0) => write!(f, "{}", self.stream_id),
            (None, port) => write!(f, "{}@:{port}", self.stream_id),
        }
    }
}

/// Whether the text already carries a port ("host:port" or "[v6]:port")
pub(crate) fn has_port(text: &str) -> bool {
    if text.parse::<SocketAddr>().is_ok() {
        return true;
    }
    // A bare IPv6 literal contains colons but no port
    if text.parse::<IpAddr>().is_ok() {
        return false;
    }
    text.rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}

pub(crate) fn resolve_endpoint(text: &str, default_port: u16) -> StreamResult<SocketAddr> {
    let text = text.trim();
    if let Ok(endpoint) = text.parse::<SocketAddr>() {
        return Ok(endpoint);
    }
    if let Ok(ip) = text.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let resolved = if has_port(text) {
        text.to_socket_addrs()
    } else {
        (text, default_port).to_socket_addrs()
    };

    resolved
        .map_err(|e| StreamError::InvalidAddress(format!("{text}: {e}")))?
        .next()
        .ok_or_else(|| StreamError::InvalidAddress(format!("{text}: no addresses resolved")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_without_address() {
        let mut token = StreamToken::new(7, 2001);
        assert_eq!(token.stream_id(), 7);
        assert!(!token.has_address());
        assert!(!token.is_valid());
        assert!(token.endpoint().is_none());

        token.set_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(token.has_address());
        assert!(token.is_valid());
        assert_eq!(token.endpoint(), Some("127.0.0.1:2001".parse().unwrap()));
    }

    #[test]
    fn test_token_from_endpoint() {
        let token = StreamToken::from_endpoint(3, "10.1.2.3:4000".parse().unwrap());
        assert_eq!(token.port(), 4000);
        assert_eq!(token.protocol(), Protocol::Tcp);
        assert_eq!(token.address(), Some("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_token_resolve_literals() {
        let token = StreamToken::resolve(1, "192.168.0.9", 2001).unwrap();
        assert_eq!(token.endpoint(), Some("192.168.0.9:2001".parse().unwrap()));

        let token = StreamToken::resolve(1, "192.168.0.9:3000", 2001).unwrap();
        assert_eq!(token.port(), 3000);

        let token = StreamToken::resolve(1, "::1", 2001).unwrap();
        assert_eq!(token.endpoint(), Some("[::1]:2001".parse().unwrap()));
    }

    #[test]
    fn test_has_port() {
        assert!(has_port("127.0.0.1:2000"));
        assert!(has_port("[::1]:2000"));
        assert!(has_port("sim-host:2000"));
        assert!(!has_port("127.0.0.1"));
        assert!(!has_port("::1"));
        assert!(!has_port("sim-host"));
    }

    #[test]
    fn test_wire_round_trip_v4() {
        let token = StreamToken::from_endpoint(0xDEAD_BEEF, "172.16.0.4:2001".parse().unwrap());
        let bytes = token.to_bytes();

        assert_eq!(&bytes[0..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[4..6], &2001u16.to_le_bytes());
        assert_eq!(bytes[6], 1); // tcp
        assert_eq!(bytes[7], ADDRESS_V4);
        assert_eq!(&bytes[8..12], &[172, 16, 0, 4]);
        assert!(bytes[12..].iter().all(|b| *b == 0));

        assert_eq!(StreamToken::from_bytes(&bytes).unwrap(), token);
    }

    #[test]
    fn test_wire_round_trip_v6_and_unset() {
        let token = StreamToken::from_endpoint(9, "[fe80::1]:2001".parse().unwrap())
            .with_protocol(Protocol::Udp);
        assert_eq!(StreamToken::from_bytes(&token.to_bytes()).unwrap(), token);

        let partial = StreamToken::new(11, 2001);
        let decoded = StreamToken::from_bytes(&partial.to_bytes()).unwrap();
        assert!(!decoded.has_address());
        assert_eq!(decoded, partial);
    }

    #[test]
    fn test_wire_rejects_malformed() {
        assert!(matches!(
            StreamToken::from_bytes(&[0u8; 10]),
            Err(StreamError::InvalidToken(_))
        ));

        let mut bytes = StreamToken::new(1, 1).to_bytes();
        bytes[6] = 9;
        assert!(StreamToken::from_bytes(&bytes).is_err());

        let mut bytes = StreamToken::new(1, 1).to_bytes();
        bytes[7] = 5;
        assert!(StreamToken::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_parse_and_display() {
        let token: StreamToken = "7".parse().unwrap();
        assert_eq!(token, StreamToken::new(7, 0));
        assert_eq!(token.to_string(), "7");

        let token: StreamToken = "7@:2001".parse().unwrap();
        assert_eq!(token, StreamToken::new(7, 2001));
        assert_eq!(token.to_string(), "7@:2001");

        let token: StreamToken = "8@127.0.0.1:2001".parse().unwrap();
        assert_eq!(token.endpoint(), Some("127.0.0.1:2001".parse().unwrap()));
        assert_eq!(token.to_string(), "8@127.0.0.1:2001");

        let token: StreamToken = "8@[::1]:2001".parse().unwrap();
        assert_eq!(token.to_string(), "8@[::1]:2001");

        assert!("x".parse::<StreamToken>().is_err());
        assert!("7@:port".parse::<StreamToken>().is_err());
        assert!("7@nowhere".parse::<StreamToken>().is_err());
    }
}
