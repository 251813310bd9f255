//! Server: connectors on one acceptor loop, a fixed worker vector, and
//! the shared immutable tables every request sees.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::channel::HttpChannel;
use crate::error::{Error, Result};
use crate::executor::{Scheduler, SchedulerHandle};
use crate::fileinfo::{FileInfoCache, MimeTypes};
use crate::handler::{BodyMode, HandlerFactory, HttpHandler, Program, ProgramHolder};
use crate::net::connection::ConnectionFactory;
use crate::net::connector::{Connector, ConnectorConfig};
use crate::proto::fastcgi::FastcgiFactory;
use crate::proto::h1::Http1Factory;
use crate::proto::h2::Http2Factory;
use crate::request::HttpRequestInfo;
use crate::response::HttpResponse;
use crate::worker::{Worker, WorkerHandle};

/// Global limits and tuning, immutable once the server starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub worker_count: usize,
    /// Pin worker n to CPU n.
    pub pin_workers: bool,
    pub max_request_uri_length: usize,
    pub max_request_header_size: usize,
    pub max_request_header_count: usize,
    pub max_request_body_size: u64,
    pub max_keep_alive_requests: usize,
    pub keep_alive_timeout: Duration,
    pub fileinfo_ttl: Duration,
    /// Drain budget for graceful shutdown before force-closing.
    pub shutdown_grace: Duration,
    pub http2_max_concurrent_streams: u32,
    pub http2_header_table_size: u32,
    pub http2_initial_window_size: u32,
    pub http2_max_frame_size: u32,
    pub http2_max_header_list_size: u32,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            worker_count: num_cpus::get(),
            pin_workers: false,
            max_request_uri_length: 8 * 1024,
            max_request_header_size: 64 * 1024,
            max_request_header_count: 100,
            max_request_body_size: 16 * 1024 * 1024,
            max_keep_alive_requests: 100,
            keep_alive_timeout: Duration::from_secs(60),
            fileinfo_ttl: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            http2_max_concurrent_streams: 100,
            http2_header_table_size: 4096,
            http2_initial_window_size: 65_535,
            http2_max_frame_size: 16_384,
            http2_max_header_list_size: 64 * 1024,
        }
    }
}

type VoidHook = Arc<dyn Fn() + Send + Sync>;
type WorkerHook = Arc<dyn Fn(usize) + Send + Sync>;
type ChannelHook = Arc<dyn Fn(&mut HttpChannel) + Send + Sync>;
type RequestDoneHook = Arc<dyn Fn(&HttpRequestInfo, &HttpResponse) + Send + Sync>;

/// Global hook points; registered before start, fired from whichever
/// thread owns the event.
#[derive(Default)]
pub struct Hooks {
    worker_spawn: Vec<WorkerHook>,
    worker_unspawn: Vec<WorkerHook>,
    connection_open: Vec<VoidHook>,
    connection_close: Vec<VoidHook>,
    pre_process: Vec<ChannelHook>,
    post_process: Vec<ChannelHook>,
    request_done: Vec<RequestDoneHook>,
    cycle_logs: Vec<VoidHook>,
}

impl Hooks {
    pub(crate) fn worker_spawn(&self, id: usize) {
        for hook in &self.worker_spawn {
            hook(id);
        }
    }

    pub(crate) fn worker_unspawn(&self, id: usize) {
        for hook in &self.worker_unspawn {
            hook(id);
        }
    }

    pub(crate) fn connection_open(&self) {
        for hook in &self.connection_open {
            hook();
        }
    }

    pub(crate) fn connection_close(&self) {
        for hook in &self.connection_close {
            hook();
        }
    }

    pub(crate) fn pre_process(&self, channel: &mut HttpChannel) {
        for hook in &self.pre_process {
            hook(channel);
        }
    }

    pub(crate) fn post_process(&self, channel: &mut HttpChannel) {
        for hook in &self.post_process {
            hook(channel);
        }
    }

    pub(crate) fn request_done(&self, request: &HttpRequestInfo, response: &HttpResponse) {
        for hook in &self.request_done {
            hook(request, response);
        }
    }

    pub(crate) fn cycle_logs(&self) {
        for hook in &self.cycle_logs {
            hook();
        }
    }
}

/// Immutable-after-start state shared by every worker and channel.
pub struct ServerShared {
    pub config: ServerConfig,
    pub hooks: Hooks,
    pub mime: MimeTypes,
    program: ProgramHolder,
}

impl ServerShared {
    /// The live dispatch program.
    pub fn program(&self) -> Arc<Program> {
        self.program.load()
    }

    /// Atomically swaps the dispatch program; in-flight requests keep
    /// the one they started with.
    pub fn swap_program(&self, next: Arc<Program>) -> Arc<Program> {
        tracing::info!(program = next.name(), "program swap");
        self.program.swap(next)
    }

    pub(crate) fn new_fileinfo_cache(&self) -> FileInfoCache {
        FileInfoCache::new(self.config.fileinfo_ttl, self.mime.clone())
    }
}

/// The built-in fallback: every request gets a 404.
fn default_factory() -> Arc<dyn HandlerFactory> {
    Arc::new(|_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
        (
            Arc::new(|channel: &mut HttpChannel| {
                let _ = channel.send_error(StatusCode::NOT_FOUND);
            }),
            BodyMode::Immediate,
        )
    })
}

pub struct ServerBuilder {
    config: ServerConfig,
    hooks: Hooks,
    mime: MimeTypes,
    factory: Arc<dyn HandlerFactory>,
}

impl ServerBuilder {
    pub fn new() -> ServerBuilder {
        ServerBuilder {
            config: ServerConfig::default(),
            hooks: Hooks::default(),
            mime: MimeTypes::default(),
            factory: default_factory(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count.max(1);
        self
    }

    pub fn mime_types(mut self, mime: MimeTypes) -> Self {
        self.mime = mime;
        self
    }

    pub fn handler_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// A shorthand for serving one closure.
    pub fn handler(self, handler: impl Fn(&mut HttpChannel) + Send + Sync + 'static) -> Self {
        let handler: HttpHandler = Arc::new(handler);
        self.handler_factory(Arc::new(
            move |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (Arc::clone(&handler), BodyMode::Buffered)
            },
        ))
    }

    pub fn on_worker_spawn(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hooks.worker_spawn.push(Arc::new(hook));
        self
    }

    pub fn on_worker_unspawn(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hooks.worker_unspawn.push(Arc::new(hook));
        self
    }

    pub fn on_connection_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.connection_open.push(Arc::new(hook));
        self
    }

    pub fn on_connection_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.connection_close.push(Arc::new(hook));
        self
    }

    pub fn on_pre_process(
        mut self,
        hook: impl Fn(&mut HttpChannel) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.pre_process.push(Arc::new(hook));
        self
    }

    pub fn on_post_process(
        mut self,
        hook: impl Fn(&mut HttpChannel) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.post_process.push(Arc::new(hook));
        self
    }

    pub fn on_request_done(
        mut self,
        hook: impl Fn(&HttpRequestInfo, &HttpResponse) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.request_done.push(Arc::new(hook));
        self
    }

    pub fn on_cycle_logs(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.cycle_logs.push(Arc::new(hook));
        self
    }

    /// Freezes the shared tables. Used directly by tests that need a
    /// `ServerShared` without sockets.
    pub fn build_shared(self) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            config: self.config,
            hooks: self.hooks,
            mime: self.mime,
            program: ProgramHolder::new(Arc::new(Program::new("default", self.factory))),
        })
    }

    pub fn build(self) -> Result<Server> {
        let shared = self.build_shared();
        let scheduler = Rc::new(Scheduler::new().map_err(Error::new_io)?);
        let mut factories: HashMap<&'static str, Arc<dyn ConnectionFactory>> = HashMap::new();
        let h1 = Arc::new(Http1Factory::from_config(&shared.config));
        factories.insert(h1.protocol(), h1);
        let h2 = Arc::new(Http2Factory::from_config(&shared.config));
        factories.insert(h2.protocol(), h2);
        let fcgi = Arc::new(FastcgiFactory::default());
        factories.insert(fcgi.protocol(), fcgi);
        Ok(Server {
            shared,
            scheduler,
            factories,
            connectors: Vec::new(),
            workers: Vec::new(),
            worker_handles: Arc::new(Vec::new()),
            started: false,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Handle for stopping a running server from another thread.
#[derive(Clone)]
pub struct ServerControl {
    acceptor: SchedulerHandle,
}

impl ServerControl {
    /// Ends the accept loop; `Server::run` then performs the graceful
    /// drain and returns.
    pub fn shutdown(&self) {
        self.acceptor.break_loop();
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
    scheduler: Rc<Scheduler>,
    factories: HashMap<&'static str, Arc<dyn ConnectionFactory>>,
    connectors: Vec<Rc<Connector>>,
    workers: Vec<Worker>,
    worker_handles: Arc<Vec<WorkerHandle>>,
    started: bool,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    pub fn control(&self) -> ServerControl {
        ServerControl {
            acceptor: self.scheduler.handle(),
        }
    }

    /// Registers an additional protocol factory.
    pub fn register_factory(&mut self, factory: Arc<dyn ConnectionFactory>) {
        self.factories.insert(factory.protocol(), factory);
    }

    /// Binds a listener speaking `protocol` (a registered factory name).
    pub fn listen(
        &mut self,
        name: impl Into<String>,
        addr: SocketAddr,
        config: ConnectorConfig,
        protocol: &str,
    ) -> Result<SocketAddr> {
        let factory = self
            .factories
            .get(protocol)
            .cloned()
            .ok_or_else(|| {
                Error::new_listen(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no connection factory for {:?}", protocol),
                ))
            })?;
        let connector = Connector::bind(name, addr, config, factory)?;
        let bound = connector.local_addr();
        self.connectors.push(Rc::new(connector));
        Ok(bound)
    }

    /// Spawns the workers and arms every connector.
    pub fn start(&mut self) -> Result<()> {
        debug_assert!(!self.started);
        let count = self.shared.config.worker_count.max(1);
        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let pin = if self.shared.config.pin_workers {
                Some(id % num_cpus::get())
            } else {
                None
            };
            let worker =
                Worker::spawn(id, Arc::clone(&self.shared), pin).map_err(Error::new_io)?;
            handles.push(worker.handle());
            workers.push(worker);
        }
        self.workers = workers;
        self.worker_handles = Arc::new(handles);
        for connector in &self.connectors {
            connector.arm(&self.scheduler, &self.worker_handles);
        }
        self.started = true;
        tracing::info!(
            workers = count,
            connectors = self.connectors.len(),
            "server started"
        );
        Ok(())
    }

    /// Starts, runs the accept loop until [`ServerControl::shutdown`],
    /// then drains gracefully.
    pub fn run(&mut self) -> Result<()> {
        if !self.started {
            self.start()?;
        }
        self.scheduler.run_loop();
        self.stop();
        Ok(())
    }

    /// Graceful shutdown: stop accepting, let workers drain, force the
    /// stragglers closed once the grace budget is spent.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        tracing::info!("server stopping");
        for connector in &self.connectors {
            connector.disable(&self.scheduler);
        }
        let grace = self.shared.config.shutdown_grace;
        for handle in self.worker_handles.iter() {
            handle.scheduler().execute_after(grace, || {
                let ctx = crate::worker::WorkerCtx::current();
                ctx.close_all_peers();
            });
            handle.request_stop();
        }
        for worker in &mut self.workers {
            worker.stop_and_join();
        }
        self.workers.clear();
        self.started = false;
        tracing::info!("server stopped");
    }

    /// Fires the cycle-logs event: hooks run, per-worker caches drop.
    pub fn cycle_logs(&self) {
        self.shared.hooks.cycle_logs();
        for handle in self.worker_handles.iter() {
            handle.post(|ctx| ctx.cycle_caches());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_program_serves_404() {
        let shared = Server::builder().build_shared();
        let program = shared.program();
        assert_eq!(program.name(), "default");
    }

    #[test]
    fn program_reload_is_atomic_for_in_flight() {
        let shared = Server::builder().build_shared();
        let before = shared.program();
        let next = Arc::new(Program::new("v2", default_factory()));
        let old = shared.swap_program(next);
        assert_eq!(old.name(), "default");
        assert_eq!(before.name(), "default");
        assert_eq!(shared.program().name(), "v2");
    }

    #[test]
    fn builder_worker_count_floors_at_one() {
        let shared = Server::builder().worker_count(0).build_shared();
        assert_eq!(shared.config.worker_count, 1);
    }
}
