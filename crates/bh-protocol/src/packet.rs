//! Packet kinds and the text header codec.
//!
//! Every packet serializes to a single header line followed by the body:
//!
//! ```text
//! Amanda 2.6 REQ HANDLE 000-5f3a9b12 SEQ 1
//! SERVICE noop
//! ```
//!
//! The handle is an opaque ASCII token tying the packet to one in-flight
//! request; the sequence number is scoped to that handle.  The body is
//! free-form text and may itself contain newlines.

use std::fmt;

use thiserror::Error;

use crate::{PROTOCOL_MAJOR, PROTOCOL_MINOR};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed packet header: {0}")]
    MalformedHeader(String),
    #[error("malformed packet body: {0}")]
    MalformedBody(String),
}

// ---------------------------------------------------------------------------
// Packet kinds
// ---------------------------------------------------------------------------

/// The five packet kinds.  Wire tokens are exactly the upper-case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// A request for service.
    Req,
    /// A complete reply.
    Rep,
    /// A partial reply: a prefix of the eventual REP, delivered early.
    Prep,
    /// Positive acknowledgement of a REQ or REP.
    Ack,
    /// Negative acknowledgement; the body carries the error text.
    Nak,
}

impl PacketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Req => "REQ",
            PacketKind::Rep => "REP",
            PacketKind::Prep => "PREP",
            PacketKind::Ack => "ACK",
            PacketKind::Nak => "NAK",
        }
    }

    pub fn parse(token: &str) -> Option<PacketKind> {
        match token {
            "REQ" => Some(PacketKind::Req),
            "REP" => Some(PacketKind::Rep),
            "PREP" => Some(PacketKind::Prep),
            "ACK" => Some(PacketKind::Ack),
            "NAK" => Some(PacketKind::Nak),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One protocol packet: a kind plus an opaque textual body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub body: String,
}

impl Packet {
    pub fn new(kind: PacketKind, body: impl Into<String>) -> Packet {
        Packet { kind, body: body.into() }
    }

    pub fn req(body: impl Into<String>) -> Packet {
        Packet::new(PacketKind::Req, body)
    }

    pub fn rep(body: impl Into<String>) -> Packet {
        Packet::new(PacketKind::Rep, body)
    }

    pub fn prep(body: impl Into<String>) -> Packet {
        Packet::new(PacketKind::Prep, body)
    }

    pub fn ack() -> Packet {
        Packet::new(PacketKind::Ack, "")
    }

    pub fn nak(body: impl Into<String>) -> Packet {
        Packet::new(PacketKind::Nak, body)
    }
}

/// A packet plus the routing fields recovered from its header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub packet: Packet,
    pub handle: String,
    pub seq: u32,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize a packet for the wire: header line, then the body verbatim.
pub fn encode(handle: &str, seq: u32, pkt: &Packet) -> String {
    format!(
        "Amanda {}.{} {} HANDLE {} SEQ {}\n{}",
        PROTOCOL_MAJOR,
        PROTOCOL_MINOR,
        pkt.kind,
        handle,
        seq,
        pkt.body
    )
}

/// Parse a serialized packet.  The body is everything after the first
/// newline and may be empty or contain further newlines.
pub fn decode(buf: &str) -> Result<DecodedPacket, ProtocolError> {
    let (header, body) = match buf.split_once('\n') {
        Some((h, b)) => (h, b),
        None => (buf, ""),
    };
    let bad = || ProtocolError::MalformedHeader(header.to_owned());

    let mut tokens = header.split(' ');
    if tokens.next() != Some("Amanda") {
        return Err(bad());
    }
    let version = tokens.next().ok_or_else(bad)?;
    let (major, minor) = version.split_once('.').ok_or_else(bad)?;
    if major.parse::<u32>().is_err() || minor.parse::<u32>().is_err() {
        return Err(bad());
    }
    let kind = tokens
        .next()
        .and_then(PacketKind::parse)
        .ok_or_else(bad)?;
    if tokens.next() != Some("HANDLE") {
        return Err(bad());
    }
    let handle = tokens.next().ok_or_else(bad)?;
    if handle.is_empty() {
        return Err(bad());
    }
    if tokens.next() != Some("SEQ") {
        return Err(bad());
    }
    let seq: u32 = tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(bad)?;
    if tokens.next().is_some() {
        return Err(bad());
    }

    Ok(DecodedPacket {
        packet: Packet::new(kind, body),
        handle: handle.to_owned(),
        seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: every kind survives an encode/decode round trip.
    #[test]
    fn round_trip_all_kinds() {
        for (kind, body) in [
            (PacketKind::Req, "SERVICE noop\n"),
            (PacketKind::Rep, "OPTIONS features=abc;\n"),
            (PacketKind::Prep, "partial\n"),
            (PacketKind::Ack, ""),
            (PacketKind::Nak, "ERROR not allowed\n"),
        ] {
            let pkt = Packet::new(kind, body);
            let wire = encode("00-1a2b3c", 7, &pkt);
            let dec = decode(&wire).unwrap();
            assert_eq!(dec.packet, pkt);
            assert_eq!(dec.handle, "00-1a2b3c");
            assert_eq!(dec.seq, 7);
        }
    }

    /// Test: bodies may contain newlines and are preserved verbatim.
    #[test]
    fn multiline_body_preserved() {
        let body = "CONNECT DATA 50 MESG 51\nOPTIONS features=x;\ntrailing";
        let wire = encode("h", 0, &Packet::rep(body));
        let dec = decode(&wire).unwrap();
        assert_eq!(dec.packet.body, body);
    }

    /// Test: a header with an unrecognized kind token is malformed.
    #[test]
    fn unknown_kind_rejected() {
        let err = decode("Amanda 2.6 BOGUS HANDLE h SEQ 0\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
    }

    /// Test: the usual ways a header can be mangled all fail cleanly.
    #[test]
    fn malformed_headers_rejected() {
        for wire in [
            "",
            "Amanda\n",
            "Amanda 2.6 REQ\n",
            "Amanda 2.6 REQ HANDLE h\n",
            "Amanda 2.6 REQ HANDLE h SEQ\n",
            "Amanda 2.6 REQ HANDLE h SEQ x\n",
            "Amanda two.six REQ HANDLE h SEQ 0\n",
            "NotAmanda 2.6 REQ HANDLE h SEQ 0\n",
            "Amanda 2.6 REQ HANDLE h SEQ 0 extra\n",
        ] {
            assert!(decode(wire).is_err(), "accepted: {wire:?}");
        }
    }

    /// Test: a packet with no body at all (header only, no newline) decodes.
    #[test]
    fn header_only_packet() {
        let dec = decode("Amanda 2.6 ACK HANDLE h SEQ 3").unwrap();
        assert_eq!(dec.packet.kind, PacketKind::Ack);
        assert_eq!(dec.packet.body, "");
    }
}
