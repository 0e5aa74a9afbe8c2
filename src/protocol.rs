//! VLESS and Trojan request headers carried in the first binary frame.
//!
//! Both formats are recognised purely by structural fit: VLESS is tried when
//! the frame is longer than 17 bytes and starts with a zero version byte, and
//! Trojan is tried whenever VLESS was skipped or failed. A failed candidate is
//! never reported to the peer.

use crate::identity::{Identity, TROJAN_HASH_LEN};
use std::fmt;
use tracing::debug;

const CRLF: [u8; 2] = [0x0d, 0x0a];
const TROJAN_CMD_CONNECT: u8 = 0x01;
const TROJAN_MIN_LEN: usize = TROJAN_HASH_LEN + 2;

/// Reason a single protocol candidate did not match
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("header truncated: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("unknown user id")]
    BadUuid,

    #[error("password hash mismatch")]
    BadHash,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Vless,
    Trojan,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vless => f.write_str("vless"),
            Protocol::Trojan => f.write_str("trojan"),
        }
    }
}

/// Destination and leftover bytes extracted from an authenticated first frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub payload: Vec<u8>,
}

impl TunnelRequest {
    /// Bytes the server must answer with before any relayed data
    pub fn response(&self, version: u8) -> Option<[u8; 2]> {
        match self.protocol {
            Protocol::Vless => Some([version, 0]),
            Protocol::Trojan => None,
        }
    }
}

/// Address type byte values, which differ between the two formats
struct AddressTypes {
    ipv4: u8,
    domain: u8,
    ipv6: u8,
}

const VLESS_ATYP: AddressTypes = AddressTypes {
    ipv4: 1,
    domain: 2,
    ipv6: 3,
};

const TROJAN_ATYP: AddressTypes = AddressTypes {
    ipv4: 1,
    domain: 3,
    ipv6: 4,
};

/// Bounds-checked cursor over the frame
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ParseError::Truncated {
                offset: self.pos,
                need: n,
                have: self.buf.len().saturating_sub(self.pos),
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip_crlf(&mut self) {
        if self.buf[self.pos..].starts_with(&CRLF) {
            self.pos += CRLF.len();
        }
    }

    fn address(&mut self, atyp: u8, types: &AddressTypes) -> Result<String, ParseError> {
        if atyp == types.ipv4 {
            let b = self.take(4)?;
            Ok(format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3]))
        } else if atyp == types.domain {
            let len = self.u8()? as usize;
            Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
        } else if atyp == types.ipv6 {
            Ok(format_ipv6_groups(self.take(16)?))
        } else {
            Err(ParseError::UnsupportedAddressType(atyp))
        }
    }

    fn rest(&self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}

/// Render 16 address bytes as eight unpadded lowercase hex groups.
/// Zero runs are kept as-is (`2001:db8:0:0:0:0:0:1`).
fn format_ipv6_groups(bytes: &[u8]) -> String {
    bytes
        .chunks_exact(2)
        .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
        .collect::<Vec<_>>()
        .join(":")
}

/// Authenticate the first binary frame against `identity`.
///
/// Returns `None` when neither format matches; the caller closes the channel
/// without answering.
pub fn parse_first_frame(data: &[u8], identity: &Identity) -> Option<TunnelRequest> {
    if data.len() > 17 && data[0] == 0 {
        match parse_vless(data, identity) {
            Ok(req) => return Some(req),
            Err(e) => debug!("vless candidate rejected: {}", e),
        }
    }

    match parse_trojan(data, identity) {
        Ok(req) => Some(req),
        Err(e) => {
            debug!("trojan candidate rejected: {}", e);
            None
        }
    }
}

pub fn parse_vless(data: &[u8], identity: &Identity) -> Result<TunnelRequest, ParseError> {
    let mut cur = Cursor::new(data);
    let _version = cur.u8()?;

    if cur.take(16)? != identity.uuid_bytes() {
        return Err(ParseError::BadUuid);
    }

    let addons_len = cur.u8()? as usize;
    cur.take(addons_len)?;
    // Command byte; only TCP is relayed so its value is not inspected.
    let _command = cur.u8()?;

    let port = cur.u16()?;
    let atyp = cur.u8()?;
    let host = cur.address(atyp, &VLESS_ATYP)?;

    Ok(TunnelRequest {
        protocol: Protocol::Vless,
        host,
        port,
        payload: cur.rest(),
    })
}

pub fn parse_trojan(data: &[u8], identity: &Identity) -> Result<TunnelRequest, ParseError> {
    if data.len() < TROJAN_MIN_LEN {
        return Err(ParseError::Truncated {
            offset: 0,
            need: TROJAN_MIN_LEN,
            have: data.len(),
        });
    }

    let mut cur = Cursor::new(data);
    if cur.take(TROJAN_HASH_LEN)? != identity.trojan_hash().as_bytes() {
        return Err(ParseError::BadHash);
    }
    cur.skip_crlf();

    let command = cur.u8()?;
    if command != TROJAN_CMD_CONNECT {
        return Err(ParseError::UnsupportedCommand(command));
    }

    let atyp = cur.u8()?;
    let host = cur.address(atyp, &TROJAN_ATYP)?;
    let port = cur.u16()?;
    cur.skip_crlf();

    Ok(TunnelRequest {
        protocol: Protocol::Trojan,
        host,
        port,
        payload: cur.rest(),
    })
}
