//! The tunnel connection record: every descriptor, buffer, and piece of
//! bookkeeping that belongs to one client↔origin relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::blocklist::Blocklist;
use crate::buffer::Buffer;
use crate::epoll::Token;
use crate::net::TcpStream;
use crate::state::{Direction, HttpVersion};
use crate::telemetry;

pub struct Tunnel {
    pub client: TcpStream,
    pub client_w: Option<TcpStream>,
    pub target: Option<TcpStream>,
    pub target_w: Option<TcpStream>,

    pub client_hostport: String,
    pub target_host: String,
    pub target_port: u16,
    pub target_hostport: String,
    pub version: HttpVersion,

    pub to_target: Buffer,
    pub to_client: Buffer,

    pub halves_closed: u8,

    pub telemetry_enabled: bool,
    pub reached_tunneling: bool,
    pub is_blocked: bool,
    start: Instant,
    bytes_from_target: u64,

    pub blocklist: Arc<Blocklist>,

    /// The slab token currently armed for each direction's link, while
    /// Tunneling. Lets a hard error on one link force-remove the sibling's
    /// still-armed registration instead of leaving it to linger.
    client_to_target_token: Option<Token>,
    target_to_client_token: Option<Token>,
}

impl Tunnel {
    pub fn new(client: TcpStream, peer: SocketAddr, telemetry_enabled: bool, blocklist: Arc<Blocklist>) -> Tunnel {
        let client_hostport = peer.to_string();
        debug!("accepted connection from {client_hostport}");

        Tunnel {
            client,
            client_w: None,
            target: None,
            target_w: None,
            client_hostport,
            target_host: String::new(),
            target_port: 0,
            target_hostport: String::new(),
            version: HttpVersion::Http11,
            to_target: Buffer::new(),
            to_client: Buffer::new(),
            halves_closed: 0,
            telemetry_enabled,
            reached_tunneling: false,
            is_blocked: false,
            start: Instant::now(),
            bytes_from_target: 0,
            blocklist,
            client_to_target_token: None,
            target_to_client_token: None,
        }
    }

    pub fn set_target(&mut self, host: String, port: u16, version: HttpVersion) {
        self.target_hostport = format!("{host}:{port}");
        self.target_host = host;
        self.target_port = port;
        self.version = version;
    }

    pub fn add_target_bytes(&mut self, n: u64) {
        self.bytes_from_target += n;
    }

    pub fn link_token(&self, dir: Direction) -> Option<Token> {
        match dir {
            Direction::ClientToTarget => self.client_to_target_token,
            Direction::TargetToClient => self.target_to_client_token,
        }
    }

    pub fn set_link_token(&mut self, dir: Direction, token: Option<Token>) {
        match dir {
            Direction::ClientToTarget => self.client_to_target_token = token,
            Direction::TargetToClient => self.target_to_client_token = token,
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        info!(
            "tunnel ({}) -> ({}) torn down, {} bytes from target",
            self.client_hostport, self.target_hostport, self.bytes_from_target
        );

        if self.reached_tunneling && self.telemetry_enabled && !self.is_blocked {
            telemetry::emit(&self.target_host, self.bytes_from_target, self.start.elapsed());
        }
    }
}
