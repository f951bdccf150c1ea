//! Helpers for the line-oriented packet body grammar.
//!
//! REQ bodies open with `SECURITY USER <name>` on datagram transports and
//! always carry a `SERVICE <name> [<args>]` line; REP bodies may open with
//! a `KENCRYPT` marker and/or a `CONNECT <tag> <id> ...` line naming the
//! channels the service wants connected.

use crate::packet::ProtocolError;
use crate::{DATA_CHANNEL_COUNT, DATA_FD_OFFSET};

/// Split a leading `SECURITY USER <name>` line off a body, returning the
/// asserted user name and the remainder.
pub fn split_security_user(body: &str) -> Option<(&str, &str)> {
    let rest = body.strip_prefix("SECURITY USER ")?;
    let (user, rest) = match rest.split_once('\n') {
        Some((u, r)) => (u, r),
        None => (rest, ""),
    };
    let user = user.trim();
    if user.is_empty() { None } else { Some((user, rest)) }
}

// ---------------------------------------------------------------------------
// SERVICE line
// ---------------------------------------------------------------------------

/// The parsed `SERVICE` line of a request body.
///
/// `rest` is everything after that line; the dispatcher hands it to the
/// spawned service on its stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service: String,
    pub args: String,
    pub rest: String,
}

impl ServiceRequest {
    /// Parse a request body whose `SECURITY USER` prefix (if any) has
    /// already been stripped.
    pub fn parse(body: &str) -> Result<ServiceRequest, ProtocolError> {
        let (first, rest) = match body.split_once('\n') {
            Some((f, r)) => (f, r),
            None => (body, ""),
        };
        let spec = first
            .strip_prefix("SERVICE ")
            .ok_or_else(|| ProtocolError::MalformedBody("request has no SERVICE line".into()))?;
        let (service, args) = match spec.split_once(' ') {
            Some((s, a)) => (s, a),
            None => (spec, ""),
        };
        if service.is_empty() {
            return Err(ProtocolError::MalformedBody("empty service name".into()));
        }
        Ok(ServiceRequest {
            service: service.to_owned(),
            args: args.to_owned(),
            rest: rest.to_owned(),
        })
    }

    /// Format a request body: the SERVICE line followed by `rest`.
    pub fn format(service: &str, args: &str, rest: &str) -> String {
        if args.is_empty() {
            format!("SERVICE {service}\n{rest}")
        } else {
            format!("SERVICE {service} {args}\n{rest}")
        }
    }
}

// ---------------------------------------------------------------------------
// CONNECT line
// ---------------------------------------------------------------------------

/// The `CONNECT <tag> <id> [<tag> <id>]...` line of a reply body.
///
/// A service writes channel ids in its own fd-offset space (50, 51, ...);
/// the dispatcher rewrites them to wire stream ids before forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectLine {
    pub pairs: Vec<(String, u32)>,
}

impl ConnectLine {
    /// Parse a single line beginning with `CONNECT`.  Returns `None` when
    /// the line is not a CONNECT line; malformed pairs are an error.
    pub fn parse(line: &str) -> Result<Option<ConnectLine>, ProtocolError> {
        let rest = match line.strip_prefix("CONNECT") {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut tokens = rest.split_whitespace();
        let mut pairs = Vec::new();
        while let Some(tag) = tokens.next() {
            let id = tokens
                .next()
                .and_then(|t| t.parse::<u32>().ok())
                .ok_or_else(|| {
                    ProtocolError::MalformedBody(format!("CONNECT tag {tag} has no channel id"))
                })?;
            pairs.push((tag.to_owned(), id));
        }
        if pairs.is_empty() {
            return Err(ProtocolError::MalformedBody("empty CONNECT line".into()));
        }
        Ok(Some(ConnectLine { pairs }))
    }

    pub fn format(&self) -> String {
        let mut out = String::from("CONNECT");
        for (tag, id) in &self.pairs {
            out.push(' ');
            out.push_str(tag);
            out.push(' ');
            out.push_str(&id.to_string());
        }
        out
    }

    /// Translate a child-local channel id (fd-offset space) into the index
    /// of the dispatcher's data-channel table.
    pub fn local_channel_index(id: u32) -> Option<usize> {
        let idx = id.checked_sub(DATA_FD_OFFSET)? as usize;
        (idx < DATA_CHANNEL_COUNT).then_some(idx)
    }
}

// ---------------------------------------------------------------------------
// Markers and options
// ---------------------------------------------------------------------------

/// Detect and strip a leading `KENCRYPT` marker line.  Returns whether the
/// marker was present and the body without it.
pub fn strip_kencrypt(body: &str) -> (bool, &str) {
    match body.strip_prefix("KENCRYPT\n") {
        Some(rest) => (true, rest),
        None => (false, body),
    }
}

/// Whether any `OPTIONS` line of the body advertises the named item.
/// Items are `;`-separated, optionally `key=value`.
pub fn has_option(body: &str, name: &str) -> bool {
    body.lines()
        .filter_map(|l| l.strip_prefix("OPTIONS "))
        .flat_map(|opts| opts.split(';'))
        .any(|item| item == name || item.split_once('=').is_some_and(|(k, _)| k == name))
}
