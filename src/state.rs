//! The connection state machine's data types: the CONNECT line grammar,
//! the per-tunnel HTTP version tag, and the `Interest` sum type a worker's
//! slab stores one of per outstanding readiness registration.

use std::cell::RefCell;
use std::net::SocketAddrV4;
use std::rc::Rc;
use std::vec;

use crate::net::TcpStream;
use crate::resolver::PendingResolve;
use crate::tunnel::Tunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }

    fn parse(token: &str) -> Option<HttpVersion> {
        match token {
            "HTTP/1.0" => Some(HttpVersion::Http10),
            "HTTP/1.1" => Some(HttpVersion::Http11),
            _ => None,
        }
    }
}

pub struct ParsedConnect {
    pub host: String,
    pub port: u16,
    pub version: HttpVersion,
}

pub const DEFAULT_PORT: u16 = 443;

/// Parses `CONNECT host[:port] HTTP/1.x` from the first line of `request`.
/// `request` must not include the trailing `\r\n`.
pub fn parse_connect_line(request: &str) -> Option<ParsedConnect> {
    let mut parts = request.split(' ').filter(|s| !s.is_empty());

    let method = parts.next()?;
    if method != "CONNECT" {
        return None;
    }

    let authority = parts.next()?;
    let version_token = parts.next()?;
    let version = HttpVersion::parse(version_token)?;

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str.parse::<u16>().ok()?;
            (host.to_owned(), port)
        }
        _ => (authority.to_owned(), DEFAULT_PORT),
    };

    if host.is_empty() {
        return None;
    }

    Some(ParsedConnect { host, port, version })
}

/// Which half of the tunnel a `Link` drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::ClientToTarget => Direction::TargetToClient,
            Direction::TargetToClient => Direction::ClientToTarget,
        }
    }
}

/// Whether a `Link` is waiting to fill its buffer or to drain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Read,
    Write,
}

/// One direction of an established tunnel, strictly alternating between
/// `Read` and `Write`; at most one registration per link is ever armed.
pub struct Link {
    pub tunnel: Rc<RefCell<Tunnel>>,
    pub dir: Direction,
    pub mode: LinkMode,
}

/// The lookup is in flight, or a connect attempt against one candidate
/// address is in flight.
pub enum ConnectPhase {
    Resolving(PendingResolve),
    TryConnect { addrs: vec::IntoIter<SocketAddrV4>, socket: TcpStream },
}

pub struct ConnectState {
    pub tunnel: Rc<RefCell<Tunnel>>,
    pub phase: ConnectPhase,
}

/// One outstanding readiness registration, tagged with what to do when it
/// fires. Stored by value in a worker's `Slab`, keyed by `Token`.
pub enum Interest {
    Accepted(Rc<RefCell<Tunnel>>),
    Connecting(ConnectState),
    Rejecting(Rc<RefCell<Tunnel>>),
    Tunneling(Link),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_port() {
        let parsed = parse_connect_line("CONNECT example.com:8443 HTTP/1.1").unwrap();
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 8443);
        assert_eq!(parsed.version, HttpVersion::Http11);
    }

    #[test]
    fn defaults_port_when_absent() {
        let parsed = parse_connect_line("CONNECT example.com HTTP/1.0").unwrap();
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, DEFAULT_PORT);
        assert_eq!(parsed.version, HttpVersion::Http10);
    }

    #[test]
    fn rejects_non_connect_method() {
        assert!(parse_connect_line("GET example.com HTTP/1.1").is_none());
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(parse_connect_line("CONNECT example.com HTTP/2.0").is_none());
    }

    #[test]
    fn rejects_missing_host() {
        assert!(parse_connect_line("CONNECT HTTP/1.1").is_none());
    }
}
