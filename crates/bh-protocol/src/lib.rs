// bh-protocol: wire-level types for the backup request/reply protocol.
//
// Two layers live here:
//   - `packet`: the five text packet kinds (REQ/REP/PREP/ACK/NAK) and their
//     header-line codec, shared by the datagram and stream transports
//   - `frame`:  the binary `len | channel | payload` token that stream
//     transports use to multiplex channels over one connection
//   - `body`:   helpers for the line-oriented body grammar (SERVICE,
//     SECURITY USER, CONNECT, KENCRYPT, OPTIONS)

pub mod body;
pub mod frame;
pub mod packet;

pub use body::{ConnectLine, ServiceRequest};
pub use frame::{Frame, FrameCodec, FrameError, FRAME_HEADER_BYTES};
pub use packet::{decode, encode, DecodedPacket, Packet, PacketKind, ProtocolError};

/// One network block.  Growable protocol buffers start at this size and
/// relays read child pipes in chunks of this size.
pub const NETWORK_BLOCK_BYTES: usize = 32 * 1024;

/// Upper bound on a single frame payload.  Anything larger in a frame
/// header is a protocol violation and terminates the connection.
pub const MAX_FRAME_BYTES: usize = 128 * NETWORK_BLOCK_BYTES;

/// Largest packet (header line plus body) accepted in one datagram.
pub const MAX_DGRAM_BYTES: usize = NETWORK_BLOCK_BYTES;

/// Version spoken in every packet header line.
pub const PROTOCOL_MAJOR: u32 = 2;
pub const PROTOCOL_MINOR: u32 = 6;

/// The channel that carries packets on a multiplexed stream connection.
/// Data channels are always non-zero.
pub const PROTOCOL_CHANNEL: u32 = 0;

/// Number of numbered data channels a dispatched service may open
/// (data, message, index, state, command).
pub const DATA_CHANNEL_COUNT: usize = 5;

/// First child-visible file descriptor of the data-channel pipe block; the
/// CONNECT line names channels as `DATA_FD_OFFSET + channel index`.
pub const DATA_FD_OFFSET: u32 = 50;
