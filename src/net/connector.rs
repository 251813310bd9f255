//! Listening, accepting, and handing sockets to workers.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};
use crate::executor::{Handle, Scheduler};
use crate::net::connection::{self, ConnectionFactory};
use crate::net::endpoint::EndPoint;
use crate::worker::WorkerHandle;

/// Listener and accepted-socket tuning.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub backlog: i32,
    /// Sockets accepted per readiness event.
    pub multi_accept: usize,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    /// Linux `TCP_DEFER_ACCEPT`; ignored elsewhere.
    pub defer_accept: bool,
    pub nodelay: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// `SO_LINGER` applied to accepted sockets for FIN handling;
    /// zero leaves the OS default.
    pub fin_linger: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> ConnectorConfig {
        ConnectorConfig {
            backlog: 1024,
            multi_accept: 1,
            reuse_addr: true,
            reuse_port: false,
            defer_accept: false,
            nodelay: true,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            fin_linger: Duration::from_secs(0),
        }
    }
}

/// Picks the worker that receives the next accepted socket.
pub trait ExecutorSelector: Send + Sync {
    fn select(&self, worker_count: usize) -> usize;
}

/// The default selector: plain rotation over the worker vector.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl ExecutorSelector for RoundRobin {
    fn select(&self, worker_count: usize) -> usize {
        debug_assert!(worker_count > 0);
        self.next.fetch_add(1, Ordering::Relaxed) % worker_count
    }
}

/// Binds an address and feeds accepted sockets to workers.
pub struct Connector {
    name: String,
    listener: mio::net::TcpListener,
    local_addr: SocketAddr,
    config: ConnectorConfig,
    factory: Arc<dyn ConnectionFactory>,
    selector: Box<dyn ExecutorSelector>,
    accept_handle: RefCell<Option<Handle>>,
}

impl Connector {
    /// Binds `addr` with the configured socket options.
    pub fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        config: ConnectorConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Connector> {
        Connector::bind_with_selector(name, addr, config, factory, Box::new(RoundRobin::default()))
    }

    pub fn bind_with_selector(
        name: impl Into<String>,
        addr: SocketAddr,
        config: ConnectorConfig,
        factory: Arc<dyn ConnectionFactory>,
        selector: Box<dyn ExecutorSelector>,
    ) -> Result<Connector> {
        let listener = bind_listener(addr, &config).map_err(Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(Error::new_listen)?;
        let name = name.into();
        tracing::info!(connector = %name, addr = %local_addr, protocol = factory.protocol(), "listening");
        Ok(Connector {
            name,
            listener,
            local_addr,
            config,
            factory,
            selector,
            accept_handle: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> &'static str {
        self.factory.protocol()
    }

    /// Arms the accept interest on `scheduler`; re-arms itself after
    /// every readiness event until [`disable`](Self::disable).
    pub fn arm(self: &Rc<Self>, scheduler: &Rc<Scheduler>, workers: &Arc<Vec<WorkerHandle>>) {
        let this = Rc::clone(self);
        let sched = Rc::clone(scheduler);
        let workers = Arc::clone(workers);
        let result = scheduler.execute_on_readable(
            self.listener.as_raw_fd(),
            move || {
                this.accept_batch(&workers);
                this.arm(&sched, &workers);
            },
            Duration::from_secs(0),
            || {},
        );
        match result {
            Ok(handle) => *self.accept_handle.borrow_mut() = Some(handle),
            Err(err) => tracing::error!(connector = %self.name, "failed to arm accept: {}", err),
        }
    }

    /// Stops accepting; in-flight connections are unaffected.
    pub fn disable(&self, scheduler: &Scheduler) {
        if let Some(handle) = self.accept_handle.borrow_mut().take() {
            handle.cancel();
        }
        scheduler.cancel_fd(self.listener.as_raw_fd());
    }

    /// Accepts up to `multi_accept` sockets and posts each to a worker
    /// chosen by the selector.
    pub(crate) fn accept_batch(&self, workers: &[WorkerHandle]) -> usize {
        let mut accepted = 0;
        for _ in 0..self.config.multi_accept.max(1) {
            let (stream, remote) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if connection_error(err) => continue,
                Err(err) => {
                    tracing::error!(connector = %self.name, "accept failed: {}", err);
                    break;
                }
            };
            accepted += 1;
            tracing::debug!(connector = %self.name, %remote, "accepted");
            self.configure_accepted(&stream);

            let index = self.selector.select(workers.len());
            let factory = Arc::clone(&self.factory);
            let read_timeout = self.config.read_timeout;
            let write_timeout = self.config.write_timeout;
            workers[index].post(move |ctx| {
                let mut endpoint = EndPoint::new(Box::new(stream));
                endpoint.set_read_timeout(read_timeout);
                endpoint.set_write_timeout(write_timeout);
                let machine = factory.create(ctx);
                let peer = ctx.adopt_peer(endpoint, machine);
                connection::open(ctx, &peer, false);
            });
        }
        accepted
    }

    fn configure_accepted(&self, stream: &mio::net::TcpStream) {
        if self.config.nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed: {}", err);
            }
        }
        if self.config.fin_linger > Duration::from_secs(0) {
            let sock = socket2::SockRef::from(stream);
            if let Err(err) = sock.set_linger(Some(self.config.fin_linger)) {
                tracing::debug!("set_linger failed: {}", err);
            }
        }
    }
}

/// Errors that concern only the one failed attempt, not the listener.
fn connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn bind_listener(addr: SocketAddr, config: &ConnectorConfig) -> io::Result<mio::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    #[cfg(all(unix, not(target_os = "solaris")))]
    if config.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    #[cfg(target_os = "linux")]
    if config.defer_accept {
        let secs: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &secs as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    let std_listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_rotates() {
        let selector = RoundRobin::default();
        let picks: Vec<usize> = (0..6).map(|_| selector.select(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn bind_ephemeral_port() {
        struct NullFactory;
        impl ConnectionFactory for NullFactory {
            fn protocol(&self) -> &'static str {
                "null"
            }
            fn create(
                &self,
                _worker: &Rc<crate::worker::WorkerCtx>,
            ) -> Box<dyn crate::net::Connection> {
                unreachable!("never accepts in this test")
            }
        }
        let connector = Connector::bind(
            "test",
            "127.0.0.1:0".parse().unwrap(),
            ConnectorConfig::default(),
            Arc::new(NullFactory),
        )
        .unwrap();
        assert_ne!(connector.local_addr().port(), 0);
        assert_eq!(connector.protocol(), "null");
    }
}
