//! Off-thread DNS resolution. Blocking `getaddrinfo` calls never run on an
//! event-loop worker; instead a small pool of resolver threads drains a
//! shared job queue and signals completion through a per-request eventfd,
//! exactly the indirection the event loop needs to treat "resolution done"
//! as one more readiness notification.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace};

use crate::sys::eventfd::EventFd;

type ResolveOutcome = io::Result<Vec<SocketAddrV4>>;

struct ResolveSlot {
    result: Mutex<Option<ResolveOutcome>>,
    signal: EventFd,
}

struct ResolveJob {
    host: String,
    port: u16,
    slot: Arc<ResolveSlot>,
}

/// A lookup submitted to the resolver pool. Register `fd()` with the
/// worker's poller for readability; once it fires, `take()` yields the
/// outcome exactly once.
pub struct PendingResolve {
    slot: Arc<ResolveSlot>,
}

impl PendingResolve {
    pub fn fd(&self) -> RawFd {
        self.slot.signal.as_raw_fd()
    }

    /// Consume the readiness signal and the stored outcome. Must only be
    /// called after the descriptor from `fd()` has reported readable.
    pub fn take(self) -> ResolveOutcome {
        let _ = self.slot.signal.read();
        self.slot
            .result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(io::Error::other("resolver signalled with no result")))
    }
}

impl AsRawFd for PendingResolve {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

/// A bounded pool of threads performing blocking host resolution.
pub struct Resolver {
    sender: Sender<ResolveJob>,
    threads: Vec<JoinHandle<()>>,
}

impl Resolver {
    pub fn new(n_threads: usize) -> Resolver {
        let n_threads = n_threads.max(1);
        let (sender, receiver) = mpsc::channel::<ResolveJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        let threads = (0..n_threads)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("resolver-{id}"))
                    .spawn(move || resolver_main(id, receiver))
                    .expect("failed to spawn resolver thread")
            })
            .collect();

        Resolver { sender, threads }
    }

    /// A cloned submission handle, cheap to hand to each worker thread.
    /// `Sender` is `Send` but not `Sync`, so sharing the pool across
    /// threads means giving each thread its own clone up front rather than
    /// calling through a shared `&Resolver`.
    pub fn handle(&self) -> ResolverHandle {
        ResolverHandle {
            sender: self.sender.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ResolverHandle {
    sender: Sender<ResolveJob>,
}

impl ResolverHandle {
    /// Submit a lookup; never blocks the caller.
    pub fn resolve(&self, host: &str, port: u16) -> PendingResolve {
        let slot = Arc::new(ResolveSlot {
            result: Mutex::new(None),
            signal: EventFd::new().expect("failed to create resolver completion eventfd"),
        });

        let job = ResolveJob {
            host: host.to_owned(),
            port,
            slot: Arc::clone(&slot),
        };

        // The channel outlives every resolver thread until `Resolver` is
        // dropped, so this can only fail during shutdown races we don't hit.
        let _ = self.sender.send(job);

        PendingResolve { slot }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // Dropping `sender` would require moving it out of `&mut self`; instead
        // we rely on every clone in the threads being gone once they observe
        // a closed channel. Since `Resolver` holds the only sender, replacing
        // it with a fresh, immediately-dropped channel closes the real one.
        let (stub_tx, _stub_rx) = mpsc::channel();
        let real_sender = std::mem::replace(&mut self.sender, stub_tx);
        drop(real_sender);

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn resolver_main(id: usize, receiver: Arc<Mutex<mpsc::Receiver<ResolveJob>>>) {
    trace!("resolver thread {id} started");

    loop {
        let job = {
            let receiver = receiver.lock().unwrap();
            receiver.recv()
        };

        let job = match job {
            Ok(job) => job,
            Err(_) => break,
        };

        let outcome = lookup(&job.host, job.port);
        *job.slot.result.lock().unwrap() = Some(outcome);
        let _ = job.slot.signal.write(1);
    }

    debug!("resolver thread {id} exiting");
}

/// Blocking lookup via the system resolver, restricted to IPv4 per the
/// proxy's non-goals.
fn lookup(host: &str, port: u16) -> ResolveOutcome {
    let addrs = (host, port).to_socket_addrs()?;
    let v4: Vec<SocketAddrV4> = addrs
        .filter_map(|a| match a {
            SocketAddr::V4(a) => Some(a),
            SocketAddr::V6(_) => None,
        })
        .collect();

    if v4.is_empty() {
        Err(io::Error::new(io::ErrorKind::NotFound, "no IPv4 addresses found"))
    } else {
        Ok(v4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn resolves_localhost() {
        let resolver = Resolver::new(2);
        let handle = resolver.handle();
        let pending = handle.resolve("localhost", 443);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if pending.slot.result.lock().unwrap().is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "resolver did not complete in time");
            thread::sleep(Duration::from_millis(5));
        }

        let addrs = pending.take().unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 443));
    }
}
