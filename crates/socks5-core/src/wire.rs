//! SOCKS5 wire codec: encode/decode only, no I/O.
//!
//! Frame layouts are RFC 1928's greeting, method-selection, request, and
//! reply. All multi-byte integers are network (big-endian) byte order; the
//! source this crate was modeled after got the reply's port field backwards
//! by hand-rolling `htons` byte swaps — here it's just `u16::to_be_bytes`.

use thiserror::Error;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

/// Cap on the number of methods a greeting may offer.
pub const MAX_METHODS: usize = 16;
/// Cap on a DOMAIN address label's length.
pub const MAX_DOMAIN_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame shorter than its declared/minimum length")]
    Truncated,
    #[error("expected SOCKS version 0x05, got {0:#04x}")]
    BadVersion(u8),
    #[error("greeting offered zero methods")]
    NoMethods,
    #[error("greeting offered more than {MAX_METHODS} methods")]
    TooManyMethods,
    #[error("unsupported command {0:#04x}, only CONNECT (0x01) is handled")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("DOMAIN address exceeds {MAX_DOMAIN_LEN} bytes")]
    DomainTooLong,
}

/// Destination address as carried on the wire. DOMAIN addresses are kept as
/// opaque bytes — the core never resolves them (see [`crate::handshake`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4([u8; 4]),
    Domain(Vec<u8>),
}

impl Address {
    fn atyp(&self) -> u8 {
        match self {
            Address::V4(_) => ATYP_IPV4,
            Address::Domain(_) => ATYP_DOMAIN,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.atyp());
        match self {
            Address::V4(octets) => out.extend_from_slice(octets),
            Address::Domain(label) => {
                out.push(label.len() as u8);
                out.extend_from_slice(label);
            }
        }
    }
}

/// Offered authentication methods from a client greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub fn offers_no_auth(&self) -> bool {
        self.methods.contains(&METHOD_NO_AUTH)
    }
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub address: Address,
    pub port: u16,
}

/// A reply to be sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub address: Address,
    pub port: u16,
}

impl Reply {
    /// Echo the request's address/port with a success status.
    pub fn success(request: &Request) -> Self {
        Self { status: Status::Success, address: request.address.clone(), port: request.port }
    }

    /// Zero-filled IPv4 address/port with the given failure status.
    pub fn failure(status: Status) -> Self {
        Self { status, address: Address::V4([0; 4]), port: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    ConnectionRefused = 0x05,
}

/// Parse a client greeting. Returns the greeting and the number of bytes
/// consumed so pipelined trailing bytes (see the handshake's pipelining
/// rule) can be retained by the caller.
pub fn decode_greeting(buf: &[u8]) -> Result<(Greeting, usize), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated);
    }
    if buf[0] != VERSION {
        return Err(CodecError::BadVersion(buf[0]));
    }
    let n = buf[1] as usize;
    if n == 0 {
        return Err(CodecError::NoMethods);
    }
    if n > MAX_METHODS {
        return Err(CodecError::TooManyMethods);
    }
    let consumed = 2 + n;
    if buf.len() < consumed {
        return Err(CodecError::Truncated);
    }
    Ok((Greeting { methods: buf[2..consumed].to_vec() }, consumed))
}

/// Encode the proxy's method-selection reply.
pub fn encode_method_selection(out: &mut Vec<u8>, method: u8) {
    out.push(VERSION);
    out.push(method);
}

/// Parse a client request. Returns the request and bytes consumed.
pub fn decode_request(buf: &[u8]) -> Result<(Request, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated);
    }
    if buf[0] != VERSION {
        return Err(CodecError::BadVersion(buf[0]));
    }
    let cmd = buf[1];
    if cmd != CMD_CONNECT {
        return Err(CodecError::UnsupportedCommand(cmd));
    }
    // buf[2] is the reserved byte, ignored.
    let atyp = buf[3];
    let (address, addr_len) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < 4 + 4 {
                return Err(CodecError::Truncated);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            (Address::V4(octets), 4)
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return Err(CodecError::Truncated);
            }
            let label_len = buf[4] as usize;
            if label_len > MAX_DOMAIN_LEN {
                return Err(CodecError::DomainTooLong);
            }
            let start = 5;
            let end = start + label_len;
            if buf.len() < end {
                return Err(CodecError::Truncated);
            }
            (Address::Domain(buf[start..end].to_vec()), 1 + label_len)
        }
        other => return Err(CodecError::UnsupportedAddressType(other)),
    };
    let port_start = 4 + addr_len;
    let port_end = port_start + 2;
    if buf.len() < port_end {
        return Err(CodecError::Truncated);
    }
    let port = u16::from_be_bytes([buf[port_start], buf[port_start + 1]]);
    Ok((Request { address, port }, port_end))
}

/// Encode a reply frame (same layout as a request, with `REP` in place of
/// `CMD`).
pub fn encode_reply(out: &mut Vec<u8>, reply: &Reply) {
    out.push(VERSION);
    out.push(reply.status as u8);
    out.push(0x00); // reserved
    reply.address.encode_into(out);
    out.extend_from_slice(&reply.port.to_be_bytes());
}
