use crate::arena::ClientArena;
use crate::logging;
use crate::net::reactor::Reactor;
use crate::net::support::NetworkResult;
use crate::pool::{WorkerPool, NUM_WORKERS};
use crate::queue::WorkQueue;
use crate::store::Store;
use mio::net::TcpListener;
use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the listener binds to. Port 0 picks an ephemeral port.
    pub addr: SocketAddr,
    /// Number of worker threads draining the work queue.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: SocketAddr::from(([0, 0, 0, 0], 6379)),
            workers: NUM_WORKERS,
        }
    }
}

/// Cloneable switch that flips the server into orderly shutdown. Handed to
/// signal handlers and tests.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// The assembled server: store, client arena, work queue, worker pool and
/// reactor, sharing one poll instance.
pub struct Server {
    reactor: Reactor,
    pool: Arc<WorkerPool>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
    log: logging::Logger,
}

impl Server {
    /// Bind the listener and spin up the worker pool. Any error here is a
    /// fatal startup error; nothing is retried.
    pub fn bind(config: &Config, log: &logging::Logger) -> NetworkResult<Server> {
        // mio's bind applies SO_REUSEADDR and a deep listen backlog; every
        // accepted socket comes back non-blocking.
        let listener = TcpListener::bind(&config.addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Arc::new(mio::Poll::new()?);
        let shutdown = Arc::new(AtomicBool::new(false));

        let store = Arc::new(Store::new());
        let arena = Arc::new(ClientArena::new(log.new(logging::o!("component" => "arena"))));
        let queue = Arc::new(WorkQueue::new());

        let pool = Arc::new(WorkerPool::new(
            config.workers,
            store,
            arena.clone(),
            queue,
            poll.clone(),
            shutdown.clone(),
            log.new(logging::o!("component" => "pool")),
        ));

        let reactor = Reactor::new(
            listener,
            poll,
            arena,
            pool.clone(),
            shutdown.clone(),
            log.new(logging::o!("component" => "reactor")),
        )?;

        Ok(Server {
            reactor,
            pool,
            shutdown,
            local_addr,
            log: log.clone(),
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Run until shutdown is requested: the reactor loop first, then the
    /// worker pool is drained and joined. In-flight requests may be dropped;
    /// the store stays consistent because every command is atomic under its
    /// lock.
    pub fn run(mut self) -> NetworkResult<()> {
        logging::info!(self.log, "server listening"; "addr" => %self.local_addr);

        let outcome = self.reactor.run();

        self.pool.shutdown();

        logging::info!(self.log, "server stopped");

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.addr.port(), 6379);
        assert_eq!(config.workers, NUM_WORKERS);
    }

    #[test]
    fn test_config_json_roundtrip_defaults() {
        // Missing fields fall back to the defaults.
        let config: Config = serdeconv::from_json_str("{}").unwrap();

        assert_eq!(config.workers, NUM_WORKERS);
        assert_eq!(config.addr.port(), 6379);
    }

    #[test]
    fn test_bind_and_orderly_shutdown() {
        let mut config = Config::default();
        config.addr = "127.0.0.1:0".parse().unwrap();
        config.workers = 2;

        let server = Server::bind(&config, &logging::test()).unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let handle = server.shutdown_handle();
        let runner = std::thread::spawn(move || server.run());

        handle.shutdown();
        runner.join().unwrap().unwrap();
    }
}
