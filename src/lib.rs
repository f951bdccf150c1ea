// backhaul: the network security and protocol core of the backup system.
//
// The workspace facade: re-exports the wire types and the security
// transports.  The per-host dispatcher and the amservice CLI live in
// `services/`.

pub use bh_protocol as protocol;
pub use bh_security as security;
