pub mod blocklist;
pub mod buffer;
pub mod config;
pub mod epoll;
pub mod net;
pub mod resolver;
pub mod state;
pub mod sys;
pub mod telemetry;
pub mod tunnel;
pub mod worker;

use std::io;
use std::sync::Arc;

use log::info;

use blocklist::Blocklist;
use config::ProxyConfig;
use net::TcpListener;
use resolver::Resolver;
use worker::Worker;

/// Starts the worker pool and runs it forever. `N/4` (minimum 1) of the
/// configured thread count is dedicated to DNS resolution; the remainder,
/// including the calling thread, run event loops.
pub fn run(config: ProxyConfig) -> io::Result<()> {
    let blocklist = Arc::new(Blocklist::load(&config.blocklist_path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?);

    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    info!("listening on 0.0.0.0:{}", config.port);

    let resolver_threads = (config.thread_count / 4).max(1);
    let resolver = Resolver::new(resolver_threads);

    let worker_threads = config.thread_count.saturating_sub(resolver_threads).max(1);

    let mut handles = Vec::with_capacity(worker_threads.saturating_sub(1));
    for id in 1..worker_threads {
        let listener = listener.try_clone()?;
        let resolver_handle = resolver.handle();
        let blocklist = Arc::clone(&blocklist);
        let telemetry = config.telemetry;

        handles.push(std::thread::Builder::new().name(format!("worker-{id}")).spawn(move || {
            let worker = Worker::new(id, listener, resolver_handle, blocklist, telemetry)?;
            worker.run()
        })?);
    }

    let worker = Worker::new(0, listener, resolver.handle(), blocklist, config.telemetry)?;
    worker.run()
}
