use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BytesMut};

use crate::ProtocolError;

pub const VER: u8 = 5;

pub(crate) const ATYP_IPV4: u8 = 1;
pub(crate) const ATYP_DOMAIN: u8 = 3;
pub(crate) const ATYP_IPV6: u8 = 4;

/// Methods this server accepts, in no particular order. Selection follows the
/// client's offer order.
pub const SUPPORTED_METHODS: &[AuthMethod] = &[AuthMethod::NoAuth];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    Gssapi,
    UsernamePassword,
    ChallengeHandshake,
    ChallengeResponse,
    Ssl,
    NdsAuth,
    MultiAuthFramework,
    JsonParameterBlock,
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(id: u8) -> Option<Self> {
        let method = match id {
            0x00 => AuthMethod::NoAuth,
            0x01 => AuthMethod::Gssapi,
            0x02 => AuthMethod::UsernamePassword,
            0x03 => AuthMethod::ChallengeHandshake,
            0x05 => AuthMethod::ChallengeResponse,
            0x06 => AuthMethod::Ssl,
            0x07 => AuthMethod::NdsAuth,
            0x08 => AuthMethod::MultiAuthFramework,
            0x09 => AuthMethod::JsonParameterBlock,
            0xff => AuthMethod::NoAcceptableMethods,
            _ => return None,
        };
        Some(method)
    }

    pub fn id(self) -> u8 {
        match self {
            AuthMethod::NoAuth => 0x00,
            AuthMethod::Gssapi => 0x01,
            AuthMethod::UsernamePassword => 0x02,
            AuthMethod::ChallengeHandshake => 0x03,
            AuthMethod::ChallengeResponse => 0x05,
            AuthMethod::Ssl => 0x06,
            AuthMethod::NdsAuth => 0x07,
            AuthMethod::MultiAuthFramework => 0x08,
            AuthMethod::JsonParameterBlock => 0x09,
            AuthMethod::NoAcceptableMethods => 0xff,
        }
    }
}

/// Picks the first offered method that is also in `supported`. Unknown
/// identifiers are skipped.
pub fn select_method(offered: &[u8], supported: &[AuthMethod]) -> Option<AuthMethod> {
    offered
        .iter()
        .filter_map(|&id| AuthMethod::from_u8(id))
        .find(|m| *m != AuthMethod::NoAcceptableMethods && supported.contains(m))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Connect),
            2 => Ok(Command::Bind),
            3 => Ok(Command::UdpAssociate),
            c => Err(ProtocolError::UnknownCommand(c)),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Granted = 0,
    GeneralFailure = 1,
    ConnectionNotAllowed = 2,
    NetworkUnreachable = 3,
    HostUnreachable = 4,
    ConnectionRefused = 5,
    TtlExpired = 6,
    CommandNotSupported = 7,
    AddressTypeNotSupported = 8,
}

/// Destination of a request. `Host` is resolved later, by whoever opens the
/// outbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Ip(SocketAddr),
    Host(String, u16),
}

impl Endpoint {
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Ip(addr) => addr.port(),
            Endpoint::Host(_, port) => *port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{}", addr),
            Endpoint::Host(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// A decoded connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub destination: Endpoint,
}

/// Per-connection negotiation progress. Only moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Greeting,
    ConnectionRequest,
    Handoff,
}

impl NegotiationState {
    pub fn next(self) -> Self {
        match self {
            NegotiationState::Greeting => NegotiationState::ConnectionRequest,
            NegotiationState::ConnectionRequest | NegotiationState::Handoff => {
                NegotiationState::Handoff
            }
        }
    }
}

/// Takes a greeting off the front of `buf` and returns the offered method
/// identifiers.
///
/// Returns `Ok(None)` when the greeting is not fully buffered yet; `buf` is
/// left untouched in that case.
pub fn decode_greeting(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    let parsed = parse_greeting(buf)?;
    Ok(consume(buf, parsed))
}

/// Takes a connection request off the front of `buf`. Same buffering rules as
/// [`decode_greeting`].
pub fn decode_request(buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
    let parsed = parse_request(buf)?;
    Ok(consume(buf, parsed))
}

fn consume<T>(buf: &mut BytesMut, parsed: Option<(T, usize)>) -> Option<T> {
    parsed.map(|(value, len)| {
        buf.advance(len);
        value
    })
}

fn parse_greeting(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != VER {
        return Err(ProtocolError::BadVersion(buf[0]));
    }

    let len = 2 + buf[1] as usize;
    if buf.len() < len {
        return Ok(None);
    }

    Ok(Some((buf[2..len].to_vec(), len)))
}

fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != VER {
        return Err(ProtocolError::BadVersion(buf[0]));
    }
    let command = Command::try_from(buf[1])?;

    let rest = &buf[4..];
    let (ip, addr_len) = match buf[3] {
        ATYP_IPV4 => {
            if rest.len() < 4 + 2 {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            (Some(IpAddr::V4(ip)), 4)
        }
        ATYP_IPV6 => {
            if rest.len() < 16 + 2 {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            (Some(IpAddr::V6(Ipv6Addr::from(octets))), 16)
        }
        ATYP_DOMAIN => {
            // length prefix, then at least the port
            if rest.is_empty() {
                return Ok(None);
            }
            let len = rest[0] as usize;
            if rest.len() < 1 + len + 2 {
                return Ok(None);
            }
            (None, 1 + len)
        }
        atyp => return Err(ProtocolError::UnknownAddressType(atyp)),
    };

    let port = u16::from_be_bytes([rest[addr_len], rest[addr_len + 1]]);
    let destination = match ip {
        Some(ip) => Endpoint::Ip(SocketAddr::new(ip, port)),
        None => {
            let host = std::str::from_utf8(&rest[1..addr_len])
                .map_err(|_| ProtocolError::InvalidDomain)?;
            if host.is_empty() {
                return Err(ProtocolError::InvalidDomain);
            }
            Endpoint::Host(host.to_string(), port)
        }
    };

    Ok(Some((
        Request {
            command,
            destination,
        },
        4 + addr_len + 2,
    )))
}

/// Encodes the method selection reply.
pub fn encode_method(method: AuthMethod) -> [u8; 2] {
    [VER, method.id()]
}

/// Encodes a request reply. `bind` is the local address of the outbound
/// socket; failures carry an all-zero IPv4 address.
pub fn encode_reply(status: ReplyStatus, bind: Option<SocketAddr>) -> Vec<u8> {
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VER, status as u8, 0]);

    match bind {
        Some(SocketAddr::V4(addr)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }

    reply
}
