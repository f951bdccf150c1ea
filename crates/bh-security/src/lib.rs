// bh-security: pluggable security transports for the backup protocol.
//
// A `Handle` is one relationship with one peer over one driver.  The
// datagram family (`bsd`/`bsdudp`) carries packets as single UDP
// datagrams with reserved-port and hosts-file authentication; the stream
// family (`bsdtcp`/`ssl`/`rsh`/`ssh`/`local`) multiplexes packets and
// data channels as frames over one connection.  `client` drives a
// request through the retry/ack/reply lifecycle; `hostauth` is the
// `.amandahosts` peer-authorization check the accepting side runs.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod hostauth;
pub mod stream;
pub mod udp;
mod util;

pub use client::{exchange, request, Reply, ReplyKind, RequestOptions};
pub use config::{SecurityConfig, TlsConfig, CONNECT_WAIT, DEFAULT_SERVICE_PORT};
pub use driver::{connect, listen, Acceptor, DriverKind, Handle, ListenMode};
pub use error::{Result, SecurityError};
pub use stream::{SecurityStream, StreamAcceptor, StreamHandle, StreamRead, StreamReader, StreamWriter};
pub use udp::{DatagramAcceptor, DatagramHandle};
pub use util::IPPORT_RESERVED;
