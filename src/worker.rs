//! The event-loop worker: owns one `Epoll` instance and a `Slab` of
//! in-flight `Interest`s, and drives every tunnel accepted on the shared
//! listening socket through the connection state machine.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::vec;

use log::{debug, info, trace, warn};
use slab::Slab;

use crate::blocklist::Blocklist;
use crate::buffer::Buffer;
use crate::epoll::{Epoll, EpollOpt, Events, Ready, Token};
use crate::net::{TcpListener, TcpStream};
use crate::resolver::ResolverHandle;
use crate::state::{parse_connect_line, ConnectPhase, ConnectState, Direction, HttpVersion, Interest, Link, LinkMode};
use crate::tunnel::Tunnel;

const EVENTS_CAPACITY: usize = 1024;
/// Reserved outside the slab's key space; `Slab` keys start at 0 and this
/// worker never accepts anywhere near `usize::MAX` connections at once.
const LISTENER_TOKEN: Token = Token(usize::MAX);

pub struct Worker {
    id: usize,
    epoll: Epoll,
    slab: Slab<Interest>,
    listener: TcpListener,
    resolver: ResolverHandle,
    blocklist: Arc<Blocklist>,
    telemetry: bool,
}

impl Worker {
    pub fn new(
        id: usize,
        listener: TcpListener,
        resolver: ResolverHandle,
        blocklist: Arc<Blocklist>,
        telemetry: bool,
    ) -> io::Result<Worker> {
        Ok(Worker {
            id,
            epoll: Epoll::new()?,
            slab: Slab::new(),
            listener,
            resolver,
            blocklist,
            telemetry,
        })
    }

    pub fn run(mut self) -> io::Result<()> {
        self.epoll.add(&self.listener.as_raw_fd(), LISTENER_TOKEN, Ready::readable(), EpollOpt::edge())?;
        info!("worker {} listening", self.id);

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.epoll.wait(&mut events, None)?;

            for event in &events {
                if event.token() == LISTENER_TOKEN {
                    self.accept_all();
                } else {
                    self.dispatch(event.token());
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token) {
        let interest = match self.slab.try_remove(token.into()) {
            Some(i) => i,
            None => return,
        };

        match interest {
            Interest::Accepted(tunnel) => self.step_accepted(tunnel),
            Interest::Connecting(state) => self.step_connecting(state),
            Interest::Rejecting(tunnel) => self.step_rejecting(tunnel),
            Interest::Tunneling(link) => {
                // This registration is no longer in the slab; clear the
                // stored token before it can become stale (the slab key
                // may be reused by the very next `arm` call).
                link.tunnel.borrow_mut().set_link_token(link.dir, None);
                self.step_tunneling(link);
            }
        }
    }

    /// Registers `interest` with the poller. Re-arming an already-known fd
    /// (the hot path: every tunneling read/write cycle) is a `modify`;
    /// a brand new fd falls back to `add` when `modify` reports `ENOENT`.
    fn arm(&mut self, fd: RawFd, ready: Ready, interest: Interest) -> io::Result<Token> {
        let key = self.slab.insert(interest);
        let token = Token(key);
        let opts = EpollOpt::level() | EpollOpt::oneshot();

        let result = match self.epoll.modify(&fd, token, ready, opts) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => self.epoll.add(&fd, token, ready, opts),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(token),
            Err(e) => {
                self.slab.remove(key);
                Err(e)
            }
        }
    }

    fn arm_link(&mut self, tunnel: Rc<RefCell<Tunnel>>, dir: Direction, mode: LinkMode) -> io::Result<()> {
        let ready = match mode {
            LinkMode::Read => Ready::readable(),
            LinkMode::Write => Ready::writable(),
        };
        let fd = link_fd(&tunnel.borrow(), dir, mode);
        let link_tunnel = Rc::clone(&tunnel);
        let token = self.arm(fd, ready, Interest::Tunneling(Link { tunnel: link_tunnel, dir, mode }))?;
        tunnel.borrow_mut().set_link_token(dir, Some(token));
        Ok(())
    }

    /// Force-removes the sibling link's still-armed slab entry, dropping its
    /// `Rc<RefCell<Tunnel>>` so a hard error on one direction doesn't leave
    /// the other direction's registration (and the tunnel itself) lingering.
    fn force_close_sibling(&mut self, tunnel: &Rc<RefCell<Tunnel>>, dir: Direction) {
        let sibling = dir.opposite();
        let token = match tunnel.borrow().link_token(sibling) {
            Some(token) => token,
            None => return,
        };
        tunnel.borrow_mut().set_link_token(sibling, None);
        let _ = self.slab.try_remove(token.into());
    }

    fn accept_all(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("worker {}: accept failed: {e}", self.id);
                    return;
                }
            };

            let tunnel = Rc::new(RefCell::new(Tunnel::new(stream, peer, self.telemetry, Arc::clone(&self.blocklist))));
            let fd = tunnel.borrow().client.as_raw_fd();

            if let Err(e) = self.arm(fd, Ready::readable(), Interest::Accepted(Rc::clone(&tunnel))) {
                warn!("worker {}: failed to register accepted connection: {e}", self.id);
            }
        }
    }

    fn step_accepted(&mut self, tunnel: Rc<RefCell<Tunnel>>) {
        enum Outcome {
            NeedMore,
            Destroy,
            Parsed { host: String, port: u16, version: HttpVersion, consumed: usize },
        }

        let outcome = {
            let mut t = tunnel.borrow_mut();
            let client_hostport = t.client_hostport.clone();
            let Tunnel { client, to_target, .. } = &mut *t;

            if to_target.is_full() {
                debug!("CONNECT request from {client_hostport} exceeded buffer capacity");
                Outcome::Destroy
            } else {
                match client.read(to_target.writable_mut()) {
                    Ok(0) => {
                        debug!("client {client_hostport} closed before sending a full CONNECT request");
                        Outcome::Destroy
                    }
                    Ok(n) => {
                        to_target.commit_write(n);

                        match find_double_crlf(to_target.readable()) {
                            Some(term_idx) => {
                                let line_end = to_target
                                    .readable()
                                    .windows(2)
                                    .position(|w| w == b"\r\n")
                                    .unwrap_or(term_idx);
                                let first_line = &to_target.readable()[..line_end];

                                match std::str::from_utf8(first_line).ok().and_then(parse_connect_line) {
                                    Some(parsed) => Outcome::Parsed {
                                        host: parsed.host,
                                        port: parsed.port,
                                        version: parsed.version,
                                        consumed: term_idx + 4,
                                    },
                                    None => {
                                        debug!("malformed CONNECT request from {client_hostport}");
                                        Outcome::Destroy
                                    }
                                }
                            }
                            None => Outcome::NeedMore,
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::NeedMore,
                    Err(e) => {
                        debug!("read error awaiting CONNECT from {client_hostport}: {e}");
                        Outcome::Destroy
                    }
                }
            }
        };

        match outcome {
            Outcome::Destroy => {}
            Outcome::NeedMore => {
                let fd = tunnel.borrow().client.as_raw_fd();
                if let Err(e) = self.arm(fd, Ready::readable(), Interest::Accepted(Rc::clone(&tunnel))) {
                    warn!("failed to re-arm client for more CONNECT bytes: {e}");
                }
            }
            Outcome::Parsed { host, port, version, consumed } => {
                {
                    let mut t = tunnel.borrow_mut();
                    t.to_target.commit_read(consumed);
                    t.set_target(host, port, version);
                }
                self.enter_connecting(tunnel);
            }
        }
    }

    fn enter_connecting(&mut self, tunnel: Rc<RefCell<Tunnel>>) {
        let (host, port, version, blocked) = {
            let t = tunnel.borrow();
            (t.target_host.clone(), t.target_port, t.version, t.blocklist.is_blocked(&t.target_host))
        };

        if blocked {
            info!("blocked CONNECT to {host}:{port}");
            tunnel.borrow_mut().is_blocked = true;
            self.begin_reject(tunnel, version);
            return;
        }

        let pending = self.resolver.resolve(&host, port);
        let fd = pending.as_raw_fd();
        let state = ConnectState {
            tunnel: Rc::clone(&tunnel),
            phase: ConnectPhase::Resolving(pending),
        };

        if let Err(e) = self.arm(fd, Ready::readable(), Interest::Connecting(state)) {
            warn!("failed to register resolver completion for {host}:{port}: {e}");
        }
    }

    fn step_connecting(&mut self, state: ConnectState) {
        let ConnectState { tunnel, phase } = state;

        match phase {
            ConnectPhase::Resolving(pending) => match pending.take() {
                Ok(addrs) => self.try_connect(tunnel, addrs.into_iter()),
                Err(e) => {
                    let version = tunnel.borrow().version;
                    let host = tunnel.borrow().target_hostport.clone();
                    info!("resolution failed for {host}: {e}");
                    self.begin_reject(tunnel, version);
                }
            },
            ConnectPhase::TryConnect { addrs, socket } => match socket.take_connect_error() {
                Ok(()) => self.enter_tunneling(tunnel, socket),
                Err(e) => {
                    trace!("connect attempt failed: {e}");
                    drop(socket);
                    self.try_connect(tunnel, addrs);
                }
            },
        }
    }

    fn try_connect(&mut self, tunnel: Rc<RefCell<Tunnel>>, mut addrs: vec::IntoIter<std::net::SocketAddrV4>) {
        loop {
            let addr = match addrs.next() {
                Some(addr) => addr,
                None => {
                    let version = tunnel.borrow().version;
                    debug!("exhausted candidate addresses for {}", tunnel.borrow().target_hostport);
                    self.begin_reject(tunnel, version);
                    return;
                }
            };

            let socket = match TcpStream::connect_v4(addr) {
                Ok(socket) => socket,
                Err(e) => {
                    trace!("connect() to {addr} failed immediately: {e}");
                    continue;
                }
            };

            let fd = socket.as_raw_fd();
            let state = ConnectState {
                tunnel: Rc::clone(&tunnel),
                phase: ConnectPhase::TryConnect { addrs, socket },
            };

            if let Err(e) = self.arm(fd, Ready::writable(), Interest::Connecting(state)) {
                warn!("failed to register connecting socket to {addr}: {e}");
            }
            return;
        }
    }

    fn begin_reject(&mut self, tunnel: Rc<RefCell<Tunnel>>, version: HttpVersion) {
        {
            let mut t = tunnel.borrow_mut();
            let line = format!("{} 400 Bad Request \r\n\r\n", version.as_str());
            t.to_client.writable_mut()[..line.len()].copy_from_slice(line.as_bytes());
            t.to_client.commit_write(line.len());
        }

        let fd = tunnel.borrow().client.as_raw_fd();
        if let Err(e) = self.arm(fd, Ready::writable(), Interest::Rejecting(tunnel)) {
            warn!("failed to register rejection write: {e}");
        }
    }

    fn step_rejecting(&mut self, tunnel: Rc<RefCell<Tunnel>>) {
        enum Outcome {
            Destroy,
            Drained,
            Rearm,
        }

        let outcome = {
            let mut t = tunnel.borrow_mut();
            let client_hostport = t.client_hostport.clone();
            let Tunnel { client, to_client, .. } = &mut *t;

            match client.write(to_client.readable()) {
                Ok(0) => {
                    debug!("write returned 0 rejecting {client_hostport}");
                    Outcome::Destroy
                }
                Ok(n) => {
                    to_client.commit_read(n);
                    if to_client.is_empty() {
                        Outcome::Drained
                    } else {
                        Outcome::Rearm
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Rearm,
                Err(e) => {
                    debug!("write error rejecting {client_hostport}: {e}");
                    Outcome::Destroy
                }
            }
        };

        match outcome {
            Outcome::Destroy | Outcome::Drained => {}
            Outcome::Rearm => {
                let fd = tunnel.borrow().client.as_raw_fd();
                if let Err(e) = self.arm(fd, Ready::writable(), Interest::Rejecting(tunnel)) {
                    warn!("failed to re-arm rejection write: {e}");
                }
            }
        }
    }

    fn enter_tunneling(&mut self, tunnel: Rc<RefCell<Tunnel>>, target: TcpStream) {
        let leftover = {
            let mut t = tunnel.borrow_mut();

            let client_w = match t.client.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to dup client socket: {e}");
                    return;
                }
            };
            let target_w = match target.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to dup target socket: {e}");
                    return;
                }
            };

            t.client_w = Some(client_w);
            t.target = Some(target);
            t.target_w = Some(target_w);
            t.reached_tunneling = true;

            let line = format!("{} 200 Connection Established \r\n\r\n", t.version.as_str());
            t.to_client.writable_mut()[..line.len()].copy_from_slice(line.as_bytes());
            t.to_client.commit_write(line.len());

            info!("tunneling ({}) -> ({})", t.client_hostport, t.target_hostport);
            !t.to_target.is_empty()
        };

        if let Err(e) = self.arm_link(Rc::clone(&tunnel), Direction::TargetToClient, LinkMode::Write) {
            warn!("failed to arm target->client link: {e}");
            return;
        }

        let client_to_target_mode = if leftover { LinkMode::Write } else { LinkMode::Read };
        if let Err(e) = self.arm_link(tunnel, Direction::ClientToTarget, client_to_target_mode) {
            warn!("failed to arm client->target link: {e}");
        }
    }

    fn step_tunneling(&mut self, link: Link) {
        let Link { tunnel, dir, mode } = link;
        match mode {
            LinkMode::Read => self.tunneling_read(tunnel, dir),
            LinkMode::Write => self.tunneling_write(tunnel, dir),
        }
    }

    fn tunneling_read(&mut self, tunnel: Rc<RefCell<Tunnel>>, dir: Direction) {
        enum Outcome {
            Filled(usize),
            Eof,
            Rearm,
            Destroy,
        }

        let outcome = {
            let mut t = tunnel.borrow_mut();
            let (socket, buf) = link_io(&mut t, dir, LinkMode::Read);

            match socket.read(buf.writable_mut()) {
                Ok(0) => Outcome::Eof,
                Ok(n) => {
                    buf.commit_write(n);
                    Outcome::Filled(n)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Rearm,
                Err(e) => {
                    trace!("tunnel read error ({:?}): {e}", dir);
                    Outcome::Destroy
                }
            }
        };

        match outcome {
            Outcome::Destroy => self.force_close_sibling(&tunnel, dir),
            Outcome::Rearm => {
                if let Err(e) = self.arm_link(tunnel, dir, LinkMode::Read) {
                    warn!("failed to re-arm tunnel read: {e}");
                }
            }
            Outcome::Filled(n) => {
                if dir == Direction::TargetToClient {
                    tunnel.borrow_mut().add_target_bytes(n as u64);
                }
                if let Err(e) = self.arm_link(tunnel, dir, LinkMode::Write) {
                    warn!("failed to arm tunnel write: {e}");
                }
            }
            Outcome::Eof => self.half_close(tunnel, dir),
        }
    }

    fn tunneling_write(&mut self, tunnel: Rc<RefCell<Tunnel>>, dir: Direction) {
        enum Outcome {
            Drained,
            Partial,
            Destroy,
        }

        let outcome = {
            let mut t = tunnel.borrow_mut();
            let (socket, buf) = link_io(&mut t, dir, LinkMode::Write);

            match socket.write(buf.readable()) {
                Ok(0) => {
                    trace!("tunnel write returned 0 ({:?})", dir);
                    Outcome::Destroy
                }
                Ok(n) => {
                    buf.commit_read(n);
                    if buf.is_empty() {
                        Outcome::Drained
                    } else {
                        Outcome::Partial
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Partial,
                Err(e) => {
                    trace!("tunnel write error ({:?}): {e}", dir);
                    Outcome::Destroy
                }
            }
        };

        match outcome {
            Outcome::Destroy => self.force_close_sibling(&tunnel, dir),
            Outcome::Partial => {
                if let Err(e) = self.arm_link(tunnel, dir, LinkMode::Write) {
                    warn!("failed to re-arm tunnel write: {e}");
                }
            }
            Outcome::Drained => {
                if let Err(e) = self.arm_link(tunnel, dir, LinkMode::Read) {
                    warn!("failed to arm tunnel read: {e}");
                }
            }
        }
    }

    fn half_close(&mut self, tunnel: Rc<RefCell<Tunnel>>, dir: Direction) {
        let mut t = tunnel.borrow_mut();

        match dir {
            Direction::ClientToTarget => {
                let _ = t.client.shutdown(Shutdown::Read);
                if let Some(target_w) = &t.target_w {
                    let _ = target_w.shutdown(Shutdown::Write);
                }
            }
            Direction::TargetToClient => {
                if let Some(target) = &t.target {
                    let _ = target.shutdown(Shutdown::Read);
                }
                if let Some(client_w) = &t.client_w {
                    let _ = client_w.shutdown(Shutdown::Write);
                }
            }
        }

        t.halves_closed += 1;
        debug!(
            "half-closed {:?} for ({}) -> ({}), {}/2",
            dir, t.client_hostport, t.target_hostport, t.halves_closed
        );
    }
}

fn link_fd(t: &Tunnel, dir: Direction, mode: LinkMode) -> RawFd {
    match (dir, mode) {
        (Direction::ClientToTarget, LinkMode::Read) => t.client.as_raw_fd(),
        (Direction::ClientToTarget, LinkMode::Write) => t.target_w.as_ref().unwrap().as_raw_fd(),
        (Direction::TargetToClient, LinkMode::Read) => t.target.as_ref().unwrap().as_raw_fd(),
        (Direction::TargetToClient, LinkMode::Write) => t.client_w.as_ref().unwrap().as_raw_fd(),
    }
}

fn link_io(t: &mut Tunnel, dir: Direction, mode: LinkMode) -> (&mut TcpStream, &mut Buffer) {
    match (dir, mode) {
        (Direction::ClientToTarget, LinkMode::Read) => (&mut t.client, &mut t.to_target),
        (Direction::ClientToTarget, LinkMode::Write) => (t.target_w.as_mut().unwrap(), &mut t.to_target),
        (Direction::TargetToClient, LinkMode::Read) => (t.target.as_mut().unwrap(), &mut t.to_client),
        (Direction::TargetToClient, LinkMode::Write) => (t.client_w.as_mut().unwrap(), &mut t.to_client),
    }
}

fn find_double_crlf(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}
